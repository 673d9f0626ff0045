//! Binary-level tests: exit codes, structured output, and dry-run rendering.

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use egresswall_core::policy::{
    ENV_ALLOW_HOST, ENV_ALLOWED_PORTS, ENV_PROXY_HOST, ENV_PROXY_PORT, ENV_TRUSTED_RESOLVERS,
};

fn egresswall(scratch: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("egresswall")?;
    // A scratch working directory keeps any local .env out of the picture.
    cmd.current_dir(scratch.path());
    for key in [
        ENV_TRUSTED_RESOLVERS,
        ENV_PROXY_HOST,
        ENV_PROXY_PORT,
        ENV_ALLOWED_PORTS,
        ENV_ALLOW_HOST,
    ] {
        cmd.env_remove(key);
    }
    Ok(cmd)
}

#[test]
fn attribute_rejects_malformed_ports_with_a_structured_record() -> Result<()> {
    let scratch = TempDir::new()?;
    for raw in ["abc", "0", "65536"] {
        let mut cmd = egresswall(&scratch)?;
        cmd.args(["attribute", raw]);
        cmd.assert()
            .code(2)
            .stdout(
                predicate::str::contains(r#""pid":-1"#)
                    .and(predicate::str::contains(r#""error":"#)),
            );
    }
    Ok(())
}

#[test]
fn attribute_lookup_miss_is_data_not_a_crash() -> Result<()> {
    let scratch = TempDir::new()?;
    let mut cmd = egresswall(&scratch)?;
    // Port 4 is unassigned and privileged; nothing binds it in practice.
    cmd.args(["attribute", "4"]);
    cmd.assert().code(1).stdout(
        predicate::str::contains(r#""srcPort":4"#)
            .and(predicate::str::contains(r#""pid":-1"#))
            .and(predicate::str::contains(r#""error":"#)),
    );
    Ok(())
}

#[test]
fn dry_run_prints_the_layered_rule_sequence() -> Result<()> {
    let scratch = TempDir::new()?;
    let mut cmd = egresswall(&scratch)?;
    cmd.env(ENV_PROXY_HOST, "127.0.0.1")
        .env(ENV_TRUSTED_RESOLVERS, "8.8.8.8")
        .args(["apply", "--dry-run"]);

    let assert = cmd.assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;

    assert!(stdout.contains("-j DNAT --to-destination 127.0.0.1:3128"));
    assert!(stdout.contains("-d 8.8.8.8 -p udp --dport 53 -j RETURN"));
    assert!(stdout.contains("ip6tables"), "the v6 half is always compiled");

    // Blocked ports must come before the HTTP redirect; the default deny
    // closes the filter chain.
    let ssh_block = stdout
        .find("--dport 22 -j RETURN")
        .expect("ssh block rule missing");
    let http_redirect = stdout
        .find("--dport 80 -j DNAT")
        .expect("http redirect missing");
    assert!(ssh_block < http_redirect);
    assert!(stdout.contains("-p tcp -j DROP"));
    Ok(())
}

#[test]
fn dry_run_includes_user_allowed_ranges() -> Result<()> {
    let scratch = TempDir::new()?;
    let mut cmd = egresswall(&scratch)?;
    cmd.env(ENV_PROXY_HOST, "127.0.0.1")
        .env(ENV_ALLOWED_PORTS, "8080,9000-9010")
        .args(["apply", "--dry-run"]);

    cmd.assert().success().stdout(
        predicate::str::contains("--dport 8080 -j DNAT")
            .and(predicate::str::contains("--dport 9000:9010 -j DNAT")),
    );
    Ok(())
}

#[test]
fn apply_fails_closed_on_an_unresolvable_proxy() -> Result<()> {
    let scratch = TempDir::new()?;
    let mut cmd = egresswall(&scratch)?;
    cmd.env(ENV_PROXY_HOST, "proxy.invalid")
        .args(["apply", "--dry-run"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("proxy.invalid"));
    Ok(())
}

#[test]
fn malformed_allowed_ports_abort_before_any_rule_is_emitted() -> Result<()> {
    let scratch = TempDir::new()?;
    let mut cmd = egresswall(&scratch)?;
    cmd.env(ENV_PROXY_HOST, "127.0.0.1")
        .env(ENV_ALLOWED_PORTS, "8080,https")
        .args(["apply", "--dry-run"]);

    let assert = cmd.assert().failure();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    assert!(stdout.is_empty(), "no partial rule output on policy errors");
    Ok(())
}
