use async_trait::async_trait;
use gateway_api::NodeSelector;
use rand::seq::SliceRandom;
use relay_types::Node;

/// Uniform random choice among the eligible nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNodeSelector;

#[async_trait]
impl NodeSelector for RandomNodeSelector {
    async fn pick(
        &self,
        _application_id: &str,
        _chain_id: &str,
        nodes: &[Node],
        _request_id: &str,
    ) -> Option<Node> {
        nodes.choose(&mut rand::thread_rng()).cloned()
    }
}
