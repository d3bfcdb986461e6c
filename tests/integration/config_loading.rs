//! Layered configuration and the CLI route over a workspace.

use crate::integration::test_utils::env_lock;
use crmsim::cli::{Commands, RunContext};
use crmsim::config::ConfigLoader;
use crmsim::executor::BudgetScope;
use std::fs;
use tempfile::TempDir;

fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("config")).unwrap();
    for (name, contents) in files {
        fs::write(dir.path().join("config").join(name), contents).unwrap();
    }
    dir
}

#[test]
fn environment_name_selects_the_overlay_file() {
    let _guard = env_lock();
    let global = TempDir::new().unwrap();
    std::env::set_var("XDG_CONFIG_HOME", global.path());
    let ws = workspace(&[
        (
            "config.toml",
            "[rate_limit]\nceiling = 40\nwindow_ms = 2000\n",
        ),
        ("staging.toml", "[rate_limit]\nceiling = 15\nscope = \"job\"\n"),
    ]);

    std::env::set_var("CRMSIM_ENV", "staging");
    let staged = ConfigLoader::load(ws.path());
    std::env::remove_var("CRMSIM_ENV");
    let base = ConfigLoader::load(ws.path());
    std::env::remove_var("XDG_CONFIG_HOME");

    let staged = staged.unwrap();
    assert_eq!(staged.rate_limit.ceiling, 15);
    assert_eq!(staged.rate_limit.window_ms, 2000);
    assert_eq!(staged.rate_limit.scope, BudgetScope::Job);

    let base = base.unwrap();
    assert_eq!(base.rate_limit.ceiling, 40);
    assert_eq!(base.rate_limit.scope, BudgetScope::Credential);
}

#[test]
fn invalid_workspace_config_stops_the_cli() {
    let _guard = env_lock();
    let global = TempDir::new().unwrap();
    std::env::set_var("XDG_CONFIG_HOME", global.path());
    let ws = workspace(&[("config.toml", "[rate_limit]\nceiling = 0\n")]);
    let result = RunContext::new(ws.path().to_path_buf(), None);
    std::env::remove_var("XDG_CONFIG_HOME");

    let err = result.err().unwrap();
    assert!(err.to_string().contains("rate_limit"));
}

#[tokio::test]
async fn dry_run_through_the_cli_route() {
    let (ws, context) = {
        let _guard = env_lock();
        let global = TempDir::new().unwrap();
        std::env::set_var("XDG_CONFIG_HOME", global.path());
        let ws = workspace(&[("config.toml", "[storage]\npath = \"store\"\n")]);
        let context = RunContext::new(ws.path().to_path_buf(), None);
        std::env::remove_var("XDG_CONFIG_HOME");
        (ws, context.unwrap())
    };
    let input = ws.path().join("sim.json");
    fs::write(
        &input,
        r#"{"theme":"Space Pirates","industry":"Logistics","durationDays":7,
            "recordDistribution":{"contacts":2,"companies":1,"deals":1}}"#,
    )
    .unwrap();

    let planned = context
        .execute(&Commands::Plan {
            input: input.clone(),
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let planned: serde_json::Value = serde_json::from_str(&planned).unwrap();
    assert_eq!(planned["creates"], 4);

    let output = context
        .execute(&Commands::Run {
            input,
            owner: "cli".to_string(),
            dry_run: true,
            pacing: Some("immediate".to_string()),
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let report: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(report["status"], "completed");
    assert!(ws.path().join("store").exists());

    let jobs = context
        .execute(&Commands::Jobs {
            format: "json".to_string(),
        })
        .await
        .unwrap();
    let jobs: serde_json::Value = serde_json::from_str(&jobs).unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    assert_eq!(jobs[0]["owner"], "cli");
}
