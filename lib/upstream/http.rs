//! HTTP implementations of the upstream interfaces

use std::sync::Arc;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use url::Url;

use crate::{
    config::UpstreamConfig,
    types::{ClarityValue, ContractId, StacksAddress, Token},
    upstream::{
        BalanceIndexer, BitcoinTxSource, BlobStore, BtcTransaction, Error,
        NameResolver, Page, PoxRegistry, RawBalance, ReadOnlyCaller,
        SignerEntry, StackerEntry,
        schema::{
            BalancesResponse, NamesResponse, ReadOnlyRequest,
            ReadOnlyResponse, StxBalanceResponse,
        },
    },
};

fn join(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

/// Shared HTTP client: timeout, user agent and a process-wide rate limit
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()?;
        let limiter =
            RateLimiter::direct(Quota::per_second(config.requests_per_second));
        Ok(Self {
            client,
            limiter: Arc::new(limiter),
        })
    }

    fn transport_error(endpoint: &str, err: reqwest::Error) -> Error {
        if err.is_decode() {
            Error::malformed(endpoint, err)
        } else {
            Error::UpstreamUnavailable {
                endpoint: endpoint.to_owned(),
                reason: err.to_string(),
            }
        }
    }

    fn status_error(endpoint: &str, status: StatusCode) -> Error {
        if status == StatusCode::NOT_FOUND {
            Error::NotFound(endpoint.to_owned())
        } else if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Error::UpstreamUnavailable {
                endpoint: endpoint.to_owned(),
                reason: format!("status {status}"),
            }
        } else if status.is_client_error() {
            Error::Rejected {
                endpoint: endpoint.to_owned(),
                status: status.as_u16(),
            }
        } else {
            Error::malformed(endpoint, format!("status {status}"))
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<Vec<u8>, Error> {
        self.limiter.until_ready().await;
        tracing::trace!(endpoint, "request");
        let response = request
            .send()
            .await
            .map_err(|err| Self::transport_error(endpoint, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(endpoint, status));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| Self::transport_error(endpoint, err))?;
        Ok(body.to_vec())
    }

    pub async fn get_json<T>(&self, url: &str) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let body = self.send(self.client.get(url), url).await?;
        serde_json::from_slice(&body).map_err(|err| Error::malformed(url, err))
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = self.send(self.client.post(url).json(body), url).await?;
        serde_json::from_slice(&body).map_err(|err| Error::malformed(url, err))
    }
}

/// Stacks node and indexer API: read-only calls, balances, BNS, PoX
#[derive(Clone)]
pub struct StacksApi {
    http: HttpClient,
    base: Url,
}

impl StacksApi {
    pub fn new(http: HttpClient, base: Url) -> Self {
        Self { http, base }
    }
}

#[async_trait]
impl ReadOnlyCaller for StacksApi {
    async fn call_read_only(
        &self,
        contract: &ContractId,
        function: &str,
        args: &[ClarityValue],
    ) -> Result<ClarityValue, Error> {
        let url = join(
            &self.base,
            &format!(
                "v2/contracts/call-read/{}/{}/{function}",
                contract.address, contract.name
            ),
        );
        let request = ReadOnlyRequest {
            sender: contract.address.to_string(),
            arguments: args.iter().map(ClarityValue::to_hex).collect(),
        };
        let response: ReadOnlyResponse =
            self.http.post_json(&url, &request).await?;
        match response {
            ReadOnlyResponse {
                okay: true,
                result: Some(result),
                ..
            } => Ok(ClarityValue::from_hex(&result)?),
            ReadOnlyResponse { cause, .. } => Err(Error::malformed(
                url,
                cause.unwrap_or_else(|| "call failed without cause".to_owned()),
            )),
        }
    }
}

#[async_trait]
impl BalanceIndexer for StacksApi {
    async fn balance(
        &self,
        address: &StacksAddress,
        token: &Token,
        until_block: Option<u64>,
    ) -> Result<RawBalance, Error> {
        let query = until_block
            .map(|height| format!("?until_block={height}"))
            .unwrap_or_default();
        match token {
            Token::Stx => {
                let url = join(
                    &self.base,
                    &format!("extended/v1/address/{address}/stx{query}"),
                );
                let res: StxBalanceResponse = self.http.get_json(&url).await?;
                Ok(RawBalance {
                    balance: res.balance,
                    locked: res.locked,
                })
            }
            Token::Fungible {
                asset_identifier, ..
            } => {
                let url = join(
                    &self.base,
                    &format!("extended/v1/address/{address}/balances{query}"),
                );
                let res: BalancesResponse = self.http.get_json(&url).await?;
                let balance = res
                    .fungible_tokens
                    .get(asset_identifier)
                    .map(|ft| ft.balance)
                    .unwrap_or(0);
                Ok(RawBalance { balance, locked: 0 })
            }
        }
    }
}

#[async_trait]
impl NameResolver for StacksApi {
    async fn primary_name(
        &self,
        address: &StacksAddress,
    ) -> Result<Option<String>, Error> {
        let url = join(&self.base, &format!("v1/addresses/stacks/{address}"));
        match self.http.get_json::<NamesResponse>(&url).await {
            Ok(res) => Ok(res.names.into_iter().next()),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PoxRegistry for StacksApi {
    async fn signers(
        &self,
        cycle: u32,
        limit: u32,
        offset: u32,
    ) -> Result<Page<SignerEntry>, Error> {
        let url = join(
            &self.base,
            &format!(
                "extended/v2/pox/cycles/{cycle}/signers?limit={limit}&offset={offset}"
            ),
        );
        self.http.get_json(&url).await
    }

    async fn stackers(
        &self,
        cycle: u32,
        signing_key: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Page<StackerEntry>, Error> {
        let url = join(
            &self.base,
            &format!(
                "extended/v2/pox/cycles/{cycle}/signers/{signing_key}/stackers?limit={limit}&offset={offset}"
            ),
        );
        self.http.get_json(&url).await
    }
}

/// Esplora-compatible Bitcoin API
#[derive(Clone)]
pub struct EsploraApi {
    http: HttpClient,
    base: Url,
}

impl EsploraApi {
    pub fn new(http: HttpClient, base: Url) -> Self {
        Self { http, base }
    }
}

#[async_trait]
impl BitcoinTxSource for EsploraApi {
    async fn confirmed_txs(
        &self,
        btc_address: &str,
        last_seen: Option<&str>,
    ) -> Result<Vec<BtcTransaction>, Error> {
        let path = match last_seen {
            Some(txid) => format!("address/{btc_address}/txs/chain/{txid}"),
            None => format!("address/{btc_address}/txs/chain"),
        };
        let url = join(&self.base, &path);
        match self.http.get_json::<Vec<BtcTransaction>>(&url).await {
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            res => res,
        }
    }
}

/// Blob store with a public read root and an authenticated write root
#[derive(Clone)]
pub struct HttpBlobStore {
    http: HttpClient,
    read_base: Url,
    write_base: Option<Url>,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(
        http: HttpClient,
        read_base: Url,
        write_base: Option<Url>,
        token: Option<String>,
    ) -> Self {
        Self {
            http,
            read_base,
            write_base,
            token,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let url = join(&self.read_base, key);
        match self.http.send(self.http.client.get(&url), &url).await {
            Ok(body) => Ok(Some(body)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let Some(write_base) = &self.write_base else {
            return Err(Error::ValidationFailure(
                "blob store has no write endpoint".to_owned(),
            ));
        };
        let url = join(write_base, key);
        let mut request = self
            .http
            .client
            .request(Method::PUT, &url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(value);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let _body = self.http.send(request, &url).await?;
        Ok(())
    }
}
