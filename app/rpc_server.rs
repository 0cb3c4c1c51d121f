use std::net::SocketAddr;

use jsonrpsee::{
    core::{RpcResult, async_trait},
    server::{RpcServiceBuilder, Server, ServerHandle},
    types::ErrorObject,
};
use poll_tally::{
    cache::SnapshotBalances,
    chain::VoteLog,
    poll::PollSummary,
    stacker::StackerMapping,
    types::{PollId, PollResultSet, StacksAddress, VoteRecord},
};
use poll_tally_app_rpc_api::{RpcServer, Status};
use tower_http::{
    request_id::{
        MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
    },
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};

use crate::app::App;

fn custom_err_msg(err_msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(-1, err_msg.into(), Option::<()>::None)
}

fn custom_err<Error>(error: Error) -> ErrorObject<'static>
where
    anyhow::Error: From<Error>,
{
    let error = anyhow::Error::from(error);
    custom_err_msg(format!("{error:#}"))
}

pub struct RpcServerImpl {
    app: App,
}

#[async_trait]
impl RpcServer for RpcServerImpl {
    async fn list_polls(&self) -> RpcResult<Vec<PollSummary>> {
        Ok(self.app.registry.summaries())
    }

    async fn poll_results(&self, poll_id: PollId) -> RpcResult<PollResultSet> {
        let def = self.app.poll(&poll_id).map_err(custom_err)?;
        self.app.tallier.tally(def).await.map_err(custom_err)
    }

    async fn poll_votes(
        &self,
        poll_id: PollId,
        already_loaded: u64,
        page_size: Option<u64>,
    ) -> RpcResult<VoteLog> {
        if page_size == Some(0) {
            return Err(custom_err_msg("page size must be positive"));
        }
        let def = self.app.poll(&poll_id).map_err(custom_err)?;
        self.app
            .tallier
            .votes(def, already_loaded, page_size)
            .await
            .map_err(custom_err)
    }

    async fn snapshot_balances(
        &self,
        poll_id: PollId,
    ) -> RpcResult<Option<SnapshotBalances>> {
        let def = self.app.poll(&poll_id).map_err(custom_err)?;
        Ok(self.app.tallier.snapshot_balances(def).await)
    }

    async fn stacker_mapping(
        &self,
        cycles: Vec<u32>,
    ) -> RpcResult<StackerMapping> {
        if cycles.is_empty() {
            return Err(custom_err_msg("at least one PoX cycle is required"));
        }
        self.app
            .tallier
            .stacker_mapping(&cycles)
            .await
            .map_err(custom_err)
    }

    async fn status(&self) -> RpcResult<Status> {
        Ok(Status {
            network: self.app.network.to_string(),
            polls: self.app.registry.len(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn stop(&self) {
        tracing::info!("stop requested over RPC");
        self.app.request_shutdown();
    }

    async fn vote_by_user(
        &self,
        poll_id: PollId,
        address: StacksAddress,
    ) -> RpcResult<Option<VoteRecord>> {
        let def = self.app.poll(&poll_id).map_err(custom_err)?;
        Ok(self.app.tallier.vote_by_user(def, &address).await)
    }
}

#[derive(Clone, Debug)]
struct RequestIdMaker;

impl MakeRequestId for RequestIdMaker {
    fn make_request_id<B>(
        &mut self,
        _: &http::Request<B>,
    ) -> Option<RequestId> {
        use uuid::Uuid;
        let id = Uuid::new_v4();
        let id = id.as_simple();
        let id = format!("req_{id}");

        let Ok(header_value) = http::HeaderValue::from_str(&id) else {
            return None;
        };

        Some(RequestId::new(header_value))
    }
}

pub async fn run_server(
    app: App,
    rpc_addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, ServerHandle)> {
    const REQUEST_ID_HEADER: &str = "x-request-id";

    let tracer = tower::ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            http::HeaderName::from_static(REQUEST_ID_HEADER),
            RequestIdMaker,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get(http::HeaderName::from_static(REQUEST_ID_HEADER))
                        .and_then(|h| h.to_str().ok())
                        .filter(|s| !s.is_empty());

                    tracing::span!(
                        tracing::Level::DEBUG,
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id,
                    )
                })
                .on_request(())
                .on_eos(())
                .on_response(
                    DefaultOnResponse::new().level(tracing::Level::INFO),
                )
                .on_failure(
                    DefaultOnFailure::new().level(tracing::Level::ERROR),
                ),
        )
        .layer(PropagateRequestIdLayer::new(http::HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .into_inner();

    let http_middleware = tower::ServiceBuilder::new().layer(tracer);
    let rpc_middleware = RpcServiceBuilder::new().rpc_logger(1024);

    let server = Server::builder()
        .set_http_middleware(http_middleware)
        .set_rpc_middleware(rpc_middleware)
        .build(rpc_addr)
        .await?;

    let addr = server.local_addr()?;
    let handle = server.start(RpcServerImpl { app }.into_rpc());
    Ok((addr, handle))
}
