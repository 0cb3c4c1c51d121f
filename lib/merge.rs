//! Combine the direct, dust and BTC channels into one result set.

use std::collections::HashMap;

use crate::types::{
    AggregateTally, ChannelTally, OptionId, OptionTally, PollId, PollResultSet,
};

#[derive(Default)]
struct Accumulator {
    tallies: Vec<OptionTally>,
    index: HashMap<OptionId, usize>,
}

impl Accumulator {
    fn add(
        &mut self,
        option_id: &OptionId,
        count: u64,
        locked: u64,
        unlocked: u64,
    ) {
        let idx = *self.index.entry(option_id.clone()).or_insert_with(|| {
            self.tallies.push(OptionTally {
                option_id: option_id.clone(),
                raw_count: 0,
                percentage: 0.0,
                locked_stx: 0,
                unlocked_stx: 0,
            });
            self.tallies.len() - 1
        });
        let tally = &mut self.tallies[idx];
        tally.raw_count = tally.raw_count.saturating_add(count);
        tally.locked_stx = tally.locked_stx.saturating_add(locked);
        tally.unlocked_stx = tally.unlocked_stx.saturating_add(unlocked);
    }

    fn add_channel(&mut self, channel: &ChannelTally) {
        for (option_id, option) in &channel.options {
            self.add(
                option_id,
                option.total_stx,
                option.total_locked_stx,
                option.total_unlocked_stx,
            );
        }
    }
}

/// Options keep the order they are first seen in (direct, then dust, then
/// BTC) and are then stably sorted by descending `raw_count`.
///
/// `total_unique_voters` adds the per-channel counts: an address voting
/// through more than one channel is counted once per channel.
pub fn merge(
    poll_id: PollId,
    snapshot_height: Option<u64>,
    direct: &AggregateTally,
    dust: &ChannelTally,
    btc: &ChannelTally,
) -> PollResultSet {
    let mut acc = Accumulator::default();
    for option in &direct.options {
        acc.add(
            &option.option_id,
            option.votes,
            option.locked,
            option.unlocked,
        );
    }
    acc.add_channel(dust);
    acc.add_channel(btc);
    let Accumulator { mut tallies, .. } = acc;

    let total_votes = tallies
        .iter()
        .fold(0u64, |sum, tally| sum.saturating_add(tally.raw_count));
    for tally in &mut tallies {
        tally.percentage = if total_votes == 0 {
            0.0
        } else {
            tally.raw_count as f64 / total_votes as f64 * 100.0
        };
    }
    tallies.sort_by(|a, b| b.raw_count.cmp(&a.raw_count));

    PollResultSet {
        poll_id,
        snapshot_height,
        total_votes,
        total_unique_voters: direct
            .unique_voters
            .saturating_add(dust.unique_voters)
            .saturating_add(btc.unique_voters),
        tallies,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use approx::assert_relative_eq;

    use super::*;
    use crate::types::{AggregateOption, OptionChannelTally};

    fn direct(options: &[(&str, u64)], unique_voters: u64) -> AggregateTally {
        let options: Vec<AggregateOption> = options
            .iter()
            .map(|(id, votes)| AggregateOption {
                option_id: OptionId::from(*id),
                votes: *votes,
                locked: *votes,
                unlocked: 0,
            })
            .collect();
        AggregateTally {
            total_votes: options.iter().map(|o| o.votes).sum(),
            unique_voters,
            options,
        }
    }

    fn channel(options: &[(&str, u64)], unique_voters: u64) -> ChannelTally {
        ChannelTally {
            options: options
                .iter()
                .map(|(id, stx)| {
                    (
                        OptionId::from(*id),
                        OptionChannelTally {
                            total_voters: 1,
                            total_stx: *stx,
                            total_locked_stx: 0,
                            total_unlocked_stx: *stx,
                            voters: Vec::new(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            unique_voters,
        }
    }

    #[test]
    fn test_single_option_across_channels() {
        let res = merge(
            PollId::from("p"),
            Some(10),
            &direct(&[("x", 5)], 1),
            &channel(&[("x", 3)], 1),
            &channel(&[("x", 2)], 1),
        );
        assert_eq!(res.total_votes, 10);
        assert_eq!(res.tallies.len(), 1);
        assert_eq!(res.tallies[0].raw_count, 10);
        assert_eq!(res.tallies[0].locked_stx, 5);
        assert_eq!(res.tallies[0].unlocked_stx, 5);
        assert_relative_eq!(res.tallies[0].percentage, 100.0);
        assert_eq!(res.total_unique_voters, 3);
    }

    #[test]
    fn test_empty_inputs() {
        let empty = ChannelTally::default();
        let res = merge(
            PollId::from("p"),
            None,
            &AggregateTally::default(),
            &empty,
            &empty,
        );
        assert_eq!(res.total_votes, 0);
        assert!(res.tallies.is_empty());
        assert_eq!(res.total_unique_voters, 0);
    }

    #[test]
    fn test_zero_total_gives_zero_percentages() {
        let res = merge(
            PollId::from("p"),
            None,
            &direct(&[("a", 0), ("b", 0)], 0),
            &ChannelTally::default(),
            &ChannelTally::default(),
        );
        assert_eq!(res.tallies.len(), 2);
        assert!(res.tallies.iter().all(|t| t.percentage == 0.0));
    }

    #[test]
    fn test_percentages_sum_to_hundred_and_sort_descending() {
        let res = merge(
            PollId::from("p"),
            None,
            &direct(&[("a", 1), ("b", 2)], 2),
            &channel(&[("c", 3), ("a", 1)], 2),
            &channel(&[("d", 7)], 1),
        );
        let order: Vec<&str> =
            res.tallies.iter().map(|t| t.option_id.0.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "a", "b"]);
        let sum: f64 = res.tallies.iter().map(|t| t.percentage).sum();
        assert_relative_eq!(sum, 100.0, epsilon = 1e-9);
        assert_relative_eq!(res.tallies[0].percentage, 50.0);
        assert_eq!(res.total_votes, 14);
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let res = merge(
            PollId::from("p"),
            None,
            &direct(&[("direct", 4)], 1),
            &channel(&[("dust", 4)], 1),
            &channel(&[("btc", 4), ("direct", 0)], 1),
        );
        let order: Vec<&str> =
            res.tallies.iter().map(|t| t.option_id.0.as_str()).collect();
        assert_eq!(order, vec!["direct", "dust", "btc"]);
    }
}
