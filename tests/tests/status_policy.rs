mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use reqwest::Client;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;
    use surge::prelude::*;
    use surge::Url;

    #[tokio::test]
    #[ntest::timeout(30_000)]
    async fn default_policy_splits_success_from_server_errors() {
        init().await;

        let report = Scheduler::new([mixed_status().constant(2, Duration::from_secs(1))])
            .unwrap()
            .threshold("http_req{status:204}", "rate==0")
            .unwrap()
            .threshold("http_req{status:308}", "rate==0")
            .unwrap()
            .threshold("http_req{status:503}", "rate==1")
            .unwrap()
            .options(RunOptions {
                base_url: Url::parse(MOCK_URL).unwrap(),
                ..Default::default()
            })
            .run()
            .await;

        assert!(report.thresholds_passed(), "{report}");
        let all = report.series("http_req").unwrap();
        assert!(all.count >= 3);
        assert!(all.failures > 0 && all.failures < all.count);
    }

    static CLIENT: OnceLock<Client> = OnceLock::new();
    static NEXT: AtomicU64 = AtomicU64::new(0);

    #[scenario]
    async fn mixed_status() -> anyhow::Result<()> {
        let code = [204, 308, 503][(NEXT.fetch_add(1, Ordering::Relaxed) % 3) as usize];
        respond_with(code).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    #[transaction(metric = "http_req")]
    async fn respond_with(code: u16) -> anyhow::Result<reqwest::StatusCode> {
        let client = CLIENT.get_or_init(|| {
            Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default()
        });
        let url = base_url().join(&format!("status/{code}"))?;
        Ok(client.get(url).send().await?.status())
    }
}
