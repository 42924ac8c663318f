#![cfg(feature = "cli")]

use clap::Parser;
use gha_vm_executor::cli::Cli;

#[test]
fn parses_required_flags_and_positional_instance_spec() {
    let cli = Cli::try_parse_from([
        "gha-vm-executor",
        "instance.json",
        "--github-client-id",
        "123456",
        "--github-private-key",
        "key.pem",
        "--github-org",
        "rust-lang",
        "--runner-group-id",
        "1",
    ])
    .expect("valid invocation should parse");

    assert_eq!(cli.instance_spec.to_str().unwrap(), "instance.json");
    assert_eq!(cli.github_client_id, "123456");
    assert_eq!(cli.github_org, "rust-lang");
    assert_eq!(cli.runner_group_id, 1);
    assert_eq!(cli.images_server, "https://gha-self-hosted-images.infra.rust-lang.org");
    assert!(cli.images_cache_dir.is_none());
    assert!(cli.ssh_port.is_none());
    assert!(!cli.no_shutdown_after_job);
}

#[test]
fn missing_required_flag_is_rejected() {
    let result = Cli::try_parse_from([
        "gha-vm-executor",
        "instance.json",
        "--github-private-key",
        "key.pem",
        "--github-org",
        "rust-lang",
        "--runner-group-id",
        "1",
    ]);

    assert!(result.is_err());
}

#[test]
fn optional_flags_override_their_defaults() {
    let cli = Cli::try_parse_from([
        "gha-vm-executor",
        "instance.json",
        "--github-client-id",
        "123456",
        "--github-private-key",
        "key.pem",
        "--github-org",
        "rust-lang",
        "--runner-group-id",
        "1",
        "--images-server",
        "https://images.example.com",
        "--images-cache-dir",
        "/var/cache/gha-images",
        "--ssh-port",
        "2222",
        "--no-shutdown-after-job",
    ])
    .expect("valid invocation should parse");

    assert_eq!(cli.images_server, "https://images.example.com");
    assert_eq!(cli.images_cache_dir.unwrap().to_str().unwrap(), "/var/cache/gha-images");
    assert_eq!(cli.ssh_port, Some(2222));
    assert!(cli.no_shutdown_after_job);
}
