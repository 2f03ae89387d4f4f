//! Account provisioning against a live chain

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use anyhow::Result;
    use node_harness::{AccountProvisioner, ChainClient, RoundSynchronizer, RpcChainClient};

    use crate::common::TestEnv;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_new_account_is_funded_and_round_initialized() -> Result<()> {
        let env = TestEnv::start().await?;
        let provisioner = AccountProvisioner::new(&env.config);

        let provisioned = provisioner.provision(env.chain.rpc_uri(), None).await?;
        let address = provisioned.account.address();

        assert!(provisioned.account.is_new());
        assert!(provisioned.chain.balance(address).await? > U256::ZERO);

        // Provisioning leaves the current round initialized
        RoundSynchronizer::new(env.config.round_poll_interval)
            .wait_until_round_initialized(provisioned.chain.as_ref())
            .await?;
        assert!(provisioned.chain.current_round_initialized().await?);

        env.teardown().await
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_existing_account_is_not_funded_again() -> Result<()> {
        let env = TestEnv::start().await?;
        let provisioner = AccountProvisioner::new(&env.config);

        let first = provisioner.provision(env.chain.rpc_uri(), None).await?;
        let address = first.account.address();
        let balance_before = first.chain.balance(address).await?;

        let existing = first.account.to_existing();
        let second = provisioner
            .provision(env.chain.rpc_uri(), Some(&existing))
            .await?;

        assert!(!second.account.is_new());
        assert_eq!(second.account.address(), address);
        assert!(second.chain.balance(address).await? <= balance_before);

        drop(second);
        drop(first);
        env.teardown().await
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_dropped_fixture_removes_its_container() -> Result<()> {
        let env = TestEnv::start().await?;
        let rpc_uri = env.chain.rpc_uri().to_string();
        let controller = env.config.controller_address;

        RpcChainClient::connect(&rpc_uri, controller, None).await?;

        // Simulates a test that bailed out before teardown
        drop(env);

        assert!(RpcChainClient::connect(&rpc_uri, controller, None).await.is_err());
        Ok(())
    }
}
