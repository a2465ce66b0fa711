//! [ChainClient] over an EVM JSON-RPC endpoint.

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::{
    cfg::ChainConfig,
    client::{ChainClient, ExecutionCall, Receipt, ReceiptLog},
    contracts::IMessageGateway::{self, MessageRequest as MessageRequestEvent},
    crypto::SecretKey,
    message::{MessageRequest, ObservedEvent},
};

#[derive(Clone)]
struct Transactor {
    address: Address,
    provider: DynProvider,
}

#[derive(Clone)]
pub struct EvmChainClient {
    chain_id: u64,
    gateway: Address,
    provider: DynProvider,
    transactors: Vec<Transactor>,
}

impl EvmChainClient {
    /// Connects to `config.rpc_url` and checks the node serves the expected chain. Each transactor key gets
    /// its own wallet-filled provider so its nonces are managed independently.
    pub async fn connect(config: &ChainConfig, transactors: &[SecretKey]) -> Result<Self> {
        let url: Url = config.rpc_url.parse()?;
        let provider = ProviderBuilder::new().on_http(url.clone()).erased();

        let chain_id = provider.get_chain_id().await?;
        if chain_id != config.chain_id {
            return Err(anyhow!(
                "{} at {} reports chain id {chain_id}, expected {}",
                config.name,
                config.rpc_url,
                config.chain_id
            ));
        }

        let transactors = transactors
            .iter()
            .map(|key| Transactor {
                address: key.address(),
                provider: ProviderBuilder::new()
                    .wallet(EthereumWallet::from(key.to_signer()))
                    .on_http(url.clone())
                    .erased(),
            })
            .collect();

        Ok(EvmChainClient {
            chain_id,
            gateway: config.gateway_address,
            provider,
            transactors,
        })
    }

    fn transactor(&self, index: usize) -> Result<&Transactor> {
        self.transactors
            .get(index)
            .ok_or_else(|| anyhow!("no transactor at index {index}"))
    }

    fn observed_event(&self, log: &Log) -> Option<ObservedEvent> {
        let args = self.decode_request(&ReceiptLog {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
        })?;
        match (log.transaction_hash, log.block_hash, log.block_number) {
            (Some(transaction_hash), Some(block_hash), Some(block_number)) => Some(ObservedEvent {
                transaction_hash,
                block_hash,
                block_number,
                args,
            }),
            _ => {
                debug!(chain_id = self.chain_id, "ignoring pending request log");
                None
            }
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return Ok(None);
        };
        let (Some(block_hash), Some(block_number)) = (receipt.block_hash, receipt.block_number)
        else {
            // Not mined yet.
            return Ok(None);
        };

        let logs = receipt
            .inner
            .logs()
            .iter()
            .map(|log| ReceiptLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
            })
            .collect();

        Ok(Some(Receipt {
            block_hash,
            block_number,
            transaction_hash: receipt.transaction_hash,
            logs,
        }))
    }

    fn decode_request(&self, log: &ReceiptLog) -> Option<MessageRequest> {
        if log.address != self.gateway {
            return None;
        }
        if log.topics.first() != Some(&MessageRequestEvent::SIGNATURE_HASH) {
            return None;
        }
        match MessageRequestEvent::decode_raw_log(log.topics.iter().copied(), &log.data, true) {
            Ok(event) => Some(MessageRequest {
                tx_id: event.txId,
                dest_chain_id: event.destChainId,
                payload: event.data,
            }),
            Err(e) => {
                warn!(chain_id = self.chain_id, %e, "undecodable gateway log");
                None
            }
        }
    }

    async fn request_logs(&self, from: u64, to: u64) -> Result<Vec<ObservedEvent>> {
        let filter = Filter::new()
            .address(self.gateway)
            .event_signature(MessageRequestEvent::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);
        let logs = self.provider.get_logs(&filter).await?;

        Ok(logs
            .iter()
            .filter_map(|log| self.observed_event(log))
            .collect())
    }

    async fn is_message_valid(
        &self,
        payload: Bytes,
        signers: Vec<Address>,
        signatures: Vec<Bytes>,
    ) -> Result<bool> {
        let gateway = IMessageGateway::new(self.gateway, self.provider.clone());
        let result = gateway
            .isMessageValid(payload, signers, signatures)
            .call()
            .await?;
        Ok(result.valid)
    }

    async fn gas_price(&self) -> Result<U256> {
        Ok(U256::from(self.provider.get_gas_price().await?))
    }

    async fn estimate_execution_gas(&self, transactor: usize, call: &ExecutionCall) -> Result<u64> {
        let transactor = self.transactor(transactor)?;
        let gateway = IMessageGateway::new(self.gateway, transactor.provider.clone());
        let gas = gateway
            .messageProcess(
                call.fee,
                call.payload.clone(),
                call.signers.clone(),
                call.signatures.clone(),
            )
            .from(transactor.address)
            .estimate_gas()
            .await?;
        Ok(gas)
    }

    async fn submit_execution(
        &self,
        transactor: usize,
        call: ExecutionCall,
        gas_limit: u64,
    ) -> Result<TxHash> {
        let transactor = self.transactor(transactor)?;
        let gateway = IMessageGateway::new(self.gateway, transactor.provider.clone());
        let pending = gateway
            .messageProcess(call.fee, call.payload, call.signers, call.signatures)
            .from(transactor.address)
            .gas(gas_limit)
            .send()
            .await?;
        Ok(*pending.tx_hash())
    }

    fn transactors(&self) -> Vec<Address> {
        self.transactors.iter().map(|t| t.address).collect()
    }
}
