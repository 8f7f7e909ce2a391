mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use reqwest::{Client, StatusCode};
    use std::time::Duration;
    use surge::prelude::*;
    use surge_runtime::SurgeRuntime;

    const PLAN: &str = r#"{
        "scenarios": {
            "read_load": {
                "executor": "ramping",
                "stages": [
                    { "duration": "1s", "target": 3 },
                    { "duration": "10m", "target": 3 }
                ],
                "exec": "read_employees",
                "graceful_stop": "2s"
            }
        },
        "thresholds": {
            "http_req{type:read}": "p(95)<300",
            "http_req": ["rate<0.01"]
        }
    }"#;

    #[tokio::test]
    #[ntest::timeout(60_000)]
    async fn status_server_reports_and_stops_plan_run() {
        init().await;

        let path = std::env::temp_dir().join(format!("surge-plan-{}.json", std::process::id()));
        std::fs::write(&path, PLAN).unwrap();

        let mut registry = Registry::new();
        registry.register("read_employees", read_employees);

        let run = tokio::spawn(
            SurgeRuntime::new(registry)
                .config(&path)
                .base_url(MOCK_URL)
                .status_port(7621)
                .execute(),
        );

        let client = Client::new();
        let status = loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Ok(res) = client.get("http://127.0.0.1:7621/status").send().await {
                break res.json::<serde_json::Value>().await.unwrap();
            }
        };
        assert_eq!(status["scenarios"][0]["name"], "read_load");

        let res = client
            .post("http://127.0.0.1:7621/stop")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let report = run.await.unwrap().unwrap();
        let _ = std::fs::remove_file(path);

        assert_eq!(report.exit_code(), surge::constants::EXIT_ABORTED, "{report}");
        assert!(report.series("http_req{type:read}").unwrap().count > 0);
        assert_eq!(report.thresholds.len(), 2);
    }

    async fn read_employees() -> anyhow::Result<()> {
        read().await?;
        Ok(())
    }

    #[transaction(metric = "http_req", tags(type = "read"))]
    async fn read() -> anyhow::Result<reqwest::Response> {
        static CLIENT: std::sync::OnceLock<Client> = std::sync::OnceLock::new();
        let client = CLIENT.get_or_init(Client::new);
        let res = client.get(base_url().join("employee")?).send().await?;
        Ok(res)
    }
}
