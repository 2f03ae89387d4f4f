//! Orchestrator registration against the live protocol contracts

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use anyhow::{Context, Result};
    use node_harness::{
        NodeState, OrchestratorRegistration, RegistrationProtocol, TranscoderStatus,
    };

    use crate::common::{shutdown, TestEnv, REGISTRATION_TIMEOUT};

    #[tokio::test]
    #[ignore = "requires Docker and a node binary"]
    async fn test_register_orchestrator_with_new_account() -> Result<()> {
        let env = TestEnv::start().await?;
        let mut started = env.start_orchestrator(None).await?;
        let params = OrchestratorRegistration::default();

        let receipt = tokio::time::timeout(
            REGISTRATION_TIMEOUT,
            RegistrationProtocol::new(&env.config).register(
                &started.node,
                started.chain.as_ref(),
                &params,
            ),
        )
        .await
        .context("Registration timed out")??;

        assert!(receipt.active_round > receipt.registered_round);
        assert_eq!(started.node.state(), NodeState::Active);

        let address = started.node.config().eth_account;
        let info = params.verify_on_chain(started.chain.as_ref(), address).await?;
        assert_eq!(info.status, TranscoderStatus::Registered);
        assert!(info.active);
        assert_eq!(info.fee_share, U256::from(500_000u64));
        assert_eq!(info.reward_cut, U256::from(300_000u64));
        assert_eq!(info.delegated_stake, U256::from(50u64));

        shutdown(env, vec![&mut started.node]).await
    }

    #[tokio::test]
    #[ignore = "requires Docker and a node binary"]
    async fn test_restart_orchestrator_with_existing_account() -> Result<()> {
        let env = TestEnv::start().await?;
        let params = OrchestratorRegistration::default();

        let mut first = env.start_orchestrator(None).await?;
        tokio::time::timeout(
            REGISTRATION_TIMEOUT,
            RegistrationProtocol::new(&env.config).register(
                &first.node,
                first.chain.as_ref(),
                &params,
            ),
        )
        .await
        .context("Registration timed out")??;

        // Keep the datadir alive for the second node
        let account = first
            .node
            .stop_retaining_account()
            .await?
            .context("Node stopped twice")?;
        let existing = account.to_existing();

        let mut second = env.start_orchestrator(Some(&existing)).await?;
        assert_eq!(second.node.config().eth_account, existing.address);
        assert!(!second.node.account().map(|a| a.is_new()).unwrap_or(true));

        // Registration from the first run survives the restart
        let info = params
            .verify_on_chain(second.chain.as_ref(), existing.address)
            .await?;
        assert_eq!(info.status, TranscoderStatus::Registered);
        assert!(info.active);
        assert_eq!(info.fee_share, U256::from(500_000u64));
        assert_eq!(info.reward_cut, U256::from(300_000u64));
        assert_eq!(info.delegated_stake, U256::from(50u64));

        let result = shutdown(env, vec![&mut second.node]).await;
        drop(account);
        result
    }
}
