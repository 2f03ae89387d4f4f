//! In-memory chain used by unit tests

use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{ChainClient, TranscoderInfo, TranscoderStatus};

/// Calls observed by `MockChain`, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainCall {
    CurrentRound(U256),
    CurrentRoundInitialized(bool),
    InitializeRound,
    FundAccount(Address),
    Balance(Address),
}

#[derive(Default)]
struct MockState {
    // Rounds returned by successive `current_round` calls; the last one repeats
    rounds: VecDeque<U256>,
    initialized: VecDeque<bool>,
    balances: HashMap<Address, U256>,
    transcoders: HashMap<Address, TranscoderInfo>,
    calls: Vec<ChainCall>,
    fail_round_query: bool,
    fail_funding: bool,
}

#[derive(Default)]
pub(crate) struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub(crate) fn with_rounds(rounds: &[u64]) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().rounds = rounds.iter().map(|r| U256::from(*r)).collect();
        chain
    }

    pub(crate) fn with_initialized(sequence: &[bool]) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().initialized = sequence.iter().copied().collect();
        chain
    }

    pub(crate) fn failing_round_query(self) -> Self {
        self.state.lock().unwrap().fail_round_query = true;
        self
    }

    pub(crate) fn failing_funding(self) -> Self {
        self.state.lock().unwrap().fail_funding = true;
        self
    }

    pub(crate) fn with_transcoder(self, account: Address, info: TranscoderInfo) -> Self {
        self.state.lock().unwrap().transcoders.insert(account, info);
        self
    }

    pub(crate) fn calls(&self) -> Vec<ChainCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn round_queries(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ChainCall::CurrentRound(_)))
            .count()
    }
}

fn next_or_last<T: Copy>(queue: &mut VecDeque<T>, fallback: T) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(fallback)
    } else {
        queue.front().copied().unwrap_or(fallback)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_round(&self) -> Result<U256> {
        let mut state = self.state.lock().unwrap();
        if state.fail_round_query {
            anyhow::bail!("connection refused");
        }
        let round = next_or_last(&mut state.rounds, U256::ZERO);
        state.calls.push(ChainCall::CurrentRound(round));
        Ok(round)
    }

    async fn current_round_initialized(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_round_query {
            anyhow::bail!("connection refused");
        }
        let initialized = next_or_last(&mut state.initialized, true);
        state.calls.push(ChainCall::CurrentRoundInitialized(initialized));
        Ok(initialized)
    }

    async fn initialize_round(&self) -> Result<()> {
        self.state.lock().unwrap().calls.push(ChainCall::InitializeRound);
        Ok(())
    }

    async fn fund_account(&self, account: Address) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_funding {
            anyhow::bail!("faucet unavailable");
        }
        state.calls.push(ChainCall::FundAccount(account));
        state.balances.insert(account, U256::from(1_000_000u64));
        Ok(())
    }

    async fn balance(&self, account: Address) -> Result<U256> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ChainCall::Balance(account));
        Ok(state.balances.get(&account).copied().unwrap_or(U256::ZERO))
    }

    async fn is_active_transcoder(&self, account: Address) -> Result<bool> {
        Ok(self.transcoder_info(account).await?.active)
    }

    async fn transcoder_total_stake(&self, account: Address) -> Result<U256> {
        Ok(self.transcoder_info(account).await?.delegated_stake)
    }

    async fn transcoder_info(&self, account: Address) -> Result<TranscoderInfo> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transcoders
            .get(&account)
            .copied()
            .unwrap_or(TranscoderInfo {
                status: TranscoderStatus::NotRegistered,
                active: false,
                reward_cut: U256::ZERO,
                fee_share: U256::ZERO,
                delegated_stake: U256::ZERO,
            }))
    }
}
