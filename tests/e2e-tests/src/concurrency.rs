//! Several nodes sharing one chain fixture

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use crate::common::{shutdown, TestEnv};

    #[tokio::test]
    #[ignore = "requires Docker and a node binary"]
    async fn test_concurrent_orchestrators_get_distinct_addresses() -> Result<()> {
        let env = TestEnv::start().await?;

        let (a, b) = tokio::join!(env.start_orchestrator(None), env.start_orchestrator(None));
        let (mut a, mut b) = (a?, b?);

        let (ca, cb) = (a.node.config(), b.node.config());
        assert_ne!(ca.http_addr, cb.http_addr);
        assert_ne!(ca.cli_addr, cb.cli_addr);
        assert_ne!(ca.rtmp_addr, cb.rtmp_addr);
        assert_ne!(ca.eth_account, cb.eth_account);
        assert!(a.node.is_ready() && b.node.is_ready());

        shutdown(env, vec![&mut a.node, &mut b.node]).await
    }
}
