mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use reqwest::Client;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;
    use surge::prelude::*;
    use surge::{ScenarioPhase, Url};

    fn options() -> RunOptions {
        RunOptions {
            base_url: Url::parse(MOCK_URL).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn read_and_write_meet_thresholds() {
        init().await;

        let read = read_scenario()
            .ramping([
                Stage::new(Duration::from_secs(1), 4),
                Stage::new(Duration::from_secs(2), 4),
                Stage::new(Duration::from_secs(1), 0),
            ])
            .think_time(Duration::from_millis(100));
        let write = write_scenario()
            .constant(2, Duration::from_secs(3))
            .think_time(Duration::from_millis(200))
            .accept_status([201, 409, 422, 400]);

        let report = Scheduler::new([read, write])
            .unwrap()
            .threshold("http_req{type:read}", "p(95)<300")
            .unwrap()
            .threshold("http_req{type:write}", "p(95)<400")
            .unwrap()
            .threshold("http_req", "p(95)<800")
            .unwrap()
            .threshold("http_req", "rate<0.01")
            .unwrap()
            .threshold("http_req{status:409}", "count>0")
            .unwrap()
            .options(options())
            .run()
            .await;

        assert_eq!(report.exit_code(), 0, "{report}");

        let reads = report.scenario("read_scenario").unwrap();
        assert_eq!(reads.phase, ScenarioPhase::Finished);
        assert_eq!(reads.peak_vus, 4);
        assert_eq!(reads.active_vus, 0);

        let writes = report.series("http_req{type:write}").unwrap();
        assert!(writes.count > 0);
        assert_eq!(writes.failures, 0);
        assert!(report.series("http_req{type:read}").unwrap().count > 0);
    }

    #[tokio::test]
    async fn unaccepted_status_fails_rate_threshold() {
        init().await;

        let report = Scheduler::new([invalid_scenario().constant(1, Duration::from_secs(1))])
            .unwrap()
            .threshold("http_req", "rate<0.01")
            .unwrap()
            .threshold("http_req{status:422}", "count>0")
            .unwrap()
            .options(options())
            .run()
            .await;

        assert_eq!(
            report.exit_code(),
            surge::constants::EXIT_THRESHOLDS_FAILED,
            "{report}"
        );
        let series = report.series("http_req").unwrap();
        assert_eq!(series.failures, series.count);
        assert!(report.thresholds.iter().any(|t| t.passed));
    }

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn failing_threshold_aborts_long_run() {
        init().await;

        let scen = limited_scenario().constant(4, Duration::from_secs(600));
        let plan = Scheduler::new([scen])
            .unwrap()
            .thresholds([ThresholdExpr::parse("http_req", "rate<0.01")
                .unwrap()
                .abort_on_fail(true)])
            .options(RunOptions {
                live_evaluation: Duration::from_millis(200),
                ..options()
            });

        let report = plan.run().await;

        assert_eq!(report.exit_code(), surge::constants::EXIT_THRESHOLDS_FAILED);
        assert!(report.abort_reason.is_some());
        assert_eq!(
            report.scenario("limited_scenario").unwrap().phase,
            ScenarioPhase::Aborted
        );
    }

    /* Scenario Helpers */

    static CLIENT: OnceLock<Client> = OnceLock::new();
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    fn employee(clerk_id: &str) -> serde_json::Value {
        json!({
            "clerkId": clerk_id,
            "firstName": "Test",
            "lastName": "User",
            "email": format!("{clerk_id}@example.com"),
            "estado": "pendiente",
        })
    }

    #[scenario]
    async fn read_scenario() -> anyhow::Result<()> {
        read_employees().await?;
        Ok(())
    }

    #[scenario]
    async fn write_scenario() -> anyhow::Result<()> {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        // Every fourth write reuses an id so some creates conflict.
        let clerk_id = if n % 4 == 0 {
            "integration_shared".to_string()
        } else {
            format!("integration_{}_{n}", std::process::id())
        };
        create_employee(employee(&clerk_id)).await?;
        Ok(())
    }

    #[scenario]
    async fn invalid_scenario() -> anyhow::Result<()> {
        create_employee(employee("")).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    #[scenario]
    async fn limited_scenario() -> anyhow::Result<()> {
        limited().await?;
        Ok(())
    }

    #[transaction(metric = "http_req", tags(type = "read"))]
    async fn read_employees() -> anyhow::Result<reqwest::Response> {
        let client = CLIENT.get_or_init(Client::new);
        let res = client.get(base_url().join("employee")?).send().await?;
        Ok(res)
    }

    #[transaction(metric = "http_req", tags(type = "write"))]
    async fn create_employee(body: serde_json::Value) -> anyhow::Result<reqwest::Response> {
        let client = CLIENT.get_or_init(Client::new);
        let res = client
            .post(base_url().join("employee/")?)
            .json(&body)
            .send()
            .await?;
        Ok(res)
    }

    #[transaction(metric = "http_req")]
    async fn limited() -> anyhow::Result<reqwest::Response> {
        let client = CLIENT.get_or_init(Client::new);
        let res = client
            .get(base_url().join("limited/5/server/abort_test")?)
            .send()
            .await?;
        Ok(res)
    }
}
