//! The per-remote config file accepts more than one casing for the same
//! field; parametrized over the casings the corpus's own config examples use.

mod common;

use rstest::rstest;
use std::fs;

#[rstest]
#[case::snake_case("replication_delay_secs = 7")]
#[case::camel_case("replicationDelay = 7")]
fn delay_field_accepts_either_casing(#[case] delay_line: &str) {
    let config_dir = tempfile::tempdir().unwrap();
    let remotes = config_dir.path().join("remotes.d");
    fs::create_dir_all(&remotes).unwrap();
    fs::write(remotes.join("foo1.toml"), format!("url = \"ssh://foo1/${{name}}.git\"\nprojects = [\"*\"]\n{delay_line}\n"))
        .unwrap();

    let snapshot = replicate::config::load(&config_dir.path().join("replication.toml"), &remotes).unwrap();
    assert_eq!(snapshot.destinations["foo1"].replication_delay_secs, 7);
}

#[rstest]
#[case::snake_case("[general]\nauto_reload = true\n")]
#[case::kebab_case("[general]\nauto-reload = true\n")]
fn auto_reload_flag_accepts_either_casing(#[case] body: &str) {
    let config_dir = tempfile::tempdir().unwrap();
    let remotes = config_dir.path().join("remotes.d");
    fs::create_dir_all(&remotes).unwrap();
    let main = config_dir.path().join("replication.toml");
    fs::write(&main, body).unwrap();

    let snapshot = replicate::config::load(&main, &remotes).unwrap();
    assert!(snapshot.auto_reload);
}
