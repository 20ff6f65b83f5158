#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

//! On-chain interfaces read by the guardian.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use snafu::ResultExt;

use crate::config::ContractAddresses;
use crate::provider::{AbiDecodeSnafu, BlockTag, ProviderError, ResilientProvider, Result};

sol! {
    /// Beacon chain deposit contract.
    interface IDepositContract {
        event DepositEvent(
            bytes pubkey,
            bytes withdrawal_credentials,
            bytes amount,
            bytes signature,
            bytes index
        );

        function get_deposit_root() external view returns (bytes32);
    }

    /// Staking router of the protocol.
    interface IStakingRouter {
        function getStakingModuleIsActive(uint256 stakingModuleId) external view returns (bool);
        function getWithdrawalCredentials() external view returns (bytes32);
    }

    /// Node operator registry of a staking module.
    interface IStakingModule {
        event SigningKeyAdded(uint256 indexed nodeOperatorId, bytes pubkey);
    }

    /// Deposit security module, the contract guardian messages are addressed to.
    interface IDepositSecurityModule {
        function getGuardianIndex(address guardian) external view returns (int256);
        function ATTEST_MESSAGE_PREFIX() external view returns (bytes32);
        function PAUSE_MESSAGE_PREFIX() external view returns (bytes32);
        function UNVET_MESSAGE_PREFIX() external view returns (bytes32);
        function isDepositsPaused() external view returns (bool);
        function getMaxOperatorsPerUnvetting() external view returns (uint256);
    }
}

/// Reads of the deposit contract.
#[derive(Clone, Debug)]
pub struct DepositContract {
    provider: ResilientProvider,
    address: Address,
}

impl DepositContract {
    pub fn new(provider: ResilientProvider, address: Address) -> Self {
        Self { provider, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Root of the deposit merkle tree at `tag`.
    pub async fn get_deposit_root(&self, tag: BlockTag) -> Result<B256> {
        let output = self
            .provider
            .call_contract(self.address, &IDepositContract::get_deposit_rootCall {}, tag)
            .await?;
        Ok(output._0)
    }
}

/// Message prefixes the security module expects in signed payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessagePrefixes {
    pub attest: B256,
    pub pause: B256,
    pub unvet: B256,
}

/// Contract state a cycle acts on, all read at the same block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleState {
    /// Deposit contract merkle root.
    pub deposit_root: B256,
    /// Position of the guardian in the security module, -1 when it is not a guardian.
    pub guardian_index: i64,
    /// Withdrawal credentials every protocol deposit uses.
    pub withdrawal_credentials: B256,
    pub prefixes: MessagePrefixes,
    /// Deposit permission of each requested module, in request order.
    pub active_modules: Vec<bool>,
}

fn encoded<C: SolCall>(to: Address, call: C) -> (Address, Bytes) {
    (to, call.abi_encode().into())
}

fn decode<C: SolCall>(to: Address, output: &Bytes) -> Result<C::Return> {
    C::abi_decode_returns(output, true).context(AbiDecodeSnafu { to })
}

/// Per-cycle reads of the deposit contract, staking router and security module, sent to the
/// node as one JSON-RPC batch.
#[derive(Clone, Debug)]
pub struct CycleReader {
    provider: ResilientProvider,
    contracts: ContractAddresses,
}

impl CycleReader {
    pub fn new(provider: ResilientProvider, contracts: ContractAddresses) -> Self {
        Self {
            provider,
            contracts,
        }
    }

    /// Reads the [`CycleState`] of `guardian` and `module_ids` at `tag`.
    pub async fn read(
        &self,
        guardian: Address,
        module_ids: &[u64],
        tag: BlockTag,
    ) -> Result<CycleState> {
        let ContractAddresses {
            deposit_contract,
            staking_router,
            security_module,
        } = self.contracts;

        let mut calls = vec![
            encoded(deposit_contract, IDepositContract::get_deposit_rootCall {}),
            encoded(
                security_module,
                IDepositSecurityModule::getGuardianIndexCall { guardian },
            ),
            encoded(staking_router, IStakingRouter::getWithdrawalCredentialsCall {}),
            encoded(security_module, IDepositSecurityModule::ATTEST_MESSAGE_PREFIXCall {}),
            encoded(security_module, IDepositSecurityModule::PAUSE_MESSAGE_PREFIXCall {}),
            encoded(security_module, IDepositSecurityModule::UNVET_MESSAGE_PREFIXCall {}),
        ];
        calls.extend(module_ids.iter().map(|&id| {
            encoded(
                staking_router,
                IStakingRouter::getStakingModuleIsActiveCall {
                    stakingModuleId: U256::from(id),
                },
            )
        }));

        let outputs = self.provider.call_batch(&calls, tag).await?;
        let [root, index, wc, attest, pause, unvet, active @ ..] = outputs.as_slice() else {
            return Err(ProviderError::BatchSize {
                expected: calls.len(),
                actual: outputs.len(),
            });
        };

        let index = decode::<IDepositSecurityModule::getGuardianIndexCall>(security_module, index)?._0;
        let active_modules = active
            .iter()
            .map(|output| {
                Ok(decode::<IStakingRouter::getStakingModuleIsActiveCall>(staking_router, output)?._0)
            })
            .collect::<Result<Vec<bool>>>()?;

        Ok(CycleState {
            deposit_root: decode::<IDepositContract::get_deposit_rootCall>(deposit_contract, root)?._0,
            // anything outside i64 cannot be a position in the list
            guardian_index: i64::try_from(index).unwrap_or(-1),
            withdrawal_credentials: decode::<IStakingRouter::getWithdrawalCredentialsCall>(
                staking_router,
                wc,
            )?
            ._0,
            prefixes: MessagePrefixes {
                attest: decode::<IDepositSecurityModule::ATTEST_MESSAGE_PREFIXCall>(security_module, attest)?._0,
                pause: decode::<IDepositSecurityModule::PAUSE_MESSAGE_PREFIXCall>(security_module, pause)?._0,
                unvet: decode::<IDepositSecurityModule::UNVET_MESSAGE_PREFIXCall>(security_module, unvet)?._0,
            },
            active_modules,
        })
    }
}

/// Reads of the deposit security module made only when a cycle acts.
#[derive(Clone, Debug)]
pub struct SecurityModule {
    provider: ResilientProvider,
    address: Address,
}

impl SecurityModule {
    pub fn new(provider: ResilientProvider, address: Address) -> Self {
        Self { provider, address }
    }

    /// Whether deposits are paused protocol wide.
    pub async fn is_deposits_paused(&self, tag: BlockTag) -> Result<bool> {
        let call = IDepositSecurityModule::isDepositsPausedCall {};
        Ok(self
            .provider
            .call_contract(self.address, &call, tag)
            .await?
            ._0)
    }

    /// Largest operator batch one unvet message may carry.
    pub async fn max_operators_per_unvetting(&self, tag: BlockTag) -> Result<u64> {
        let call = IDepositSecurityModule::getMaxOperatorsPerUnvettingCall {};
        let output = self.provider.call_contract(self.address, &call, tag).await?;
        Ok(output._0.saturating_to())
    }
}
