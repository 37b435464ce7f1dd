use std::fs;
use std::path::PathBuf;

use archon_core::{EnvOverrides, Settings};
use archon_probe::{probe, Availability, UnavailableReason};
use rstest::rstest;
use tempfile::TempDir;

fn workspace(config: Option<&str>) -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    fs::create_dir_all(tmp.path().join(".specify")).expect("mkdir .specify");
    if let Some(yaml) = config {
        fs::write(tmp.path().join(".specify/archon.yaml"), yaml).expect("write config");
    }
    tmp
}

fn settings(ws: &TempDir, env: EnvOverrides) -> Settings {
    Settings::resolve_with(ws.path(), &env, None::<PathBuf>).expect("resolve")
}

#[test]
fn unconfigured_workspace_is_unavailable() {
    let ws = workspace(None);
    let result = probe(&settings(&ws, EnvOverrides::default()));
    assert_eq!(result, Availability::Unavailable(UnavailableReason::NoEndpoint));
}

#[test]
fn configured_endpoint_is_available() {
    let ws = workspace(Some("api_url: http://localhost:8181\n"));
    let result = probe(&settings(&ws, EnvOverrides::default()));
    assert_eq!(
        result,
        Availability::Available {
            api_url: "http://localhost:8181".to_string()
        }
    );
}

#[rstest]
#[case("enabled: false\napi_url: http://localhost:8181\n", UnavailableReason::DisabledByConfig)]
#[case("api_url: localhost:8181\n", UnavailableReason::InvalidEndpoint("localhost:8181".into()))]
#[case("api_url: \"   \"\n", UnavailableReason::NoEndpoint)]
fn config_reasons(#[case] yaml: &str, #[case] expected: UnavailableReason) {
    let ws = workspace(Some(yaml));
    assert_eq!(
        probe(&settings(&ws, EnvOverrides::default())),
        Availability::Unavailable(expected)
    );
}

#[test]
fn env_disable_wins_over_config() {
    let ws = workspace(Some("api_url: http://localhost:8181\n"));
    let env = EnvOverrides {
        disabled: true,
        ..EnvOverrides::default()
    };
    assert_eq!(
        probe(&settings(&ws, env)),
        Availability::Unavailable(UnavailableReason::DisabledByEnv)
    );
}

#[test]
fn probing_writes_nothing() {
    let ws = workspace(Some("api_url: http://localhost:8181\n"));
    let s = settings(&ws, EnvOverrides::default());
    let _ = probe(&s);
    assert!(!s.state_root.exists(), "probe must not create the state root");
}
