//! An administrative API

use std::{collections::BTreeMap, net::Ipv4Addr, sync::Arc};

use alloy::primitives::{Address, TxHash};
use anyhow::{Result, anyhow};
use http::{Method, header};
use jsonrpsee::{
    RpcModule,
    server::{Server, ServerHandle},
    types::{ErrorObject, ErrorObjectOwned, Params, error::ErrorCode},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, trace};

use crate::{
    driver::ChainDriver,
    heartbeat::{HeartbeatBook, HeartbeatReporter},
    message::{BridgeMessage, Heartbeat, Reset},
    p2p_node::MessageSender,
};

pub struct AdminContext {
    pub author: Address,
    pub heartbeats: Arc<HeartbeatBook>,
    pub drivers: Vec<Arc<ChainDriver>>,
    pub sender: MessageSender,
}

fn internal_error(e: anyhow::Error) -> ErrorObjectOwned {
    ErrorObject::owned(ErrorCode::InternalError.code(), e.to_string(), None::<()>)
}

pub fn rpc_module(context: AdminContext) -> Result<RpcModule<AdminContext>> {
    let mut module = RpcModule::new(context);
    module.register_method("admin_heartbeats", |params, context, _| {
        heartbeats(params, context).map_err(internal_error)
    })?;
    module.register_async_method("admin_chains", |_, context, _| async move {
        Ok::<_, ErrorObjectOwned>(HeartbeatReporter::chains(&context.drivers).await)
    })?;
    module.register_method("admin_reset", |params, context, _| {
        reset(params, context).map_err(internal_error)
    })?;
    Ok(module)
}

fn heartbeats(_params: Params, context: &AdminContext) -> Result<BTreeMap<Address, Heartbeat>> {
    Ok(context.heartbeats.snapshot())
}

/// Broadcasts a reset for `[chainId, transactionHash]`.
fn reset(params: Params, context: &AdminContext) -> Result<String> {
    let mut params = params.sequence();
    let chain_id: u64 = params.next()?;
    let transaction_hash: TxHash = params.next()?;

    if !context.drivers.iter().any(|d| d.chain_id() == chain_id) {
        return Err(anyhow!("unknown chain {chain_id}"));
    }

    context.sender.broadcast(BridgeMessage::Reset(Reset {
        source: chain_id,
        author: context.author,
        transaction_hash,
    }))?;
    info!(chain_id, %transaction_hash, "reset requested");
    Ok(format!("{transaction_hash} reset"))
}

pub async fn launch(port: u16, module: RpcModule<AdminContext>) -> Result<ServerHandle> {
    trace!("Launching admin JSON-RPC server");
    // Construct the JSON-RPC API server. We inject a [CorsLayer] to ensure web browsers can call our API directly.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers([header::CONTENT_TYPE]);
    let middleware = tower::ServiceBuilder::new().layer(cors);
    let server = Server::builder()
        .set_http_middleware(middleware)
        .build((Ipv4Addr::UNSPECIFIED, port))
        .await?;
    info!(addr = %server.local_addr()?, "admin API listening");
    Ok(server.start(module))
}
