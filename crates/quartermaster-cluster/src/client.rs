//! Process-wide cluster client.

use kube::Client;
use tokio::sync::OnceCell;
use tracing::info;

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// The shared cluster client, constructed once from the ambient
/// kubeconfig or in-cluster service account.
///
/// The broker cannot run at all without cluster access, so a client
/// construction failure aborts the process.
pub async fn cluster_client() -> Client {
    CLIENT
        .get_or_init(|| async {
            match Client::try_default().await {
                Ok(client) => {
                    info!("cluster client initialised");
                    client
                }
                Err(e) => panic!("unable to construct a cluster client: {e}"),
            }
        })
        .await
        .clone()
}
