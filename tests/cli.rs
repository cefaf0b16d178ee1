use assert_cmd::prelude::*;
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "DB_PATH={}\nBIND_HTTP=127.0.0.1:0\nBIND_WS=127.0.0.1:0\n",
        dir.path().join("quarry.db").display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn signed_event_json(tags: Vec<Vec<String>>, content: &str) -> serde_json::Value {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let created_at = 1u64;
    let kind = 1u32;
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let hash = Sha256::digest(serde_json::to_vec(&arr).unwrap());
    let id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

#[test]
fn init_creates_database() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();

    assert!(dir.path().join("quarry.db").exists());
}

#[test]
fn init_ingest_verify_round_trip() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();

    let ev = signed_event_json(vec![], "from the cli");
    let ev_path = dir.path().join("ev.json");
    fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "ingest", ev_path.to_str().unwrap()])
        .assert()
        .success();

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "verify", "--sample", "10"])
        .assert()
        .success();
}

#[test]
fn ingest_rejects_corrupted_event() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();

    let mut bad = signed_event_json(vec![], "good content");
    bad["id"] = serde_json::Value::String("ff".repeat(32));
    let bad_path = dir.path().join("bad.json");
    fs::write(&bad_path, serde_json::to_string(&bad).unwrap()).unwrap();

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "ingest", bad_path.to_str().unwrap()])
        .assert()
        .failure();

    // Nothing made it into the store.
    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "verify", "--sample", "10"])
        .assert()
        .success();
}

#[test]
fn sweep_runs_against_expired_events() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "init"])
        .assert()
        .success();

    let ev = signed_event_json(
        vec![vec!["expiration".into(), "1".into()]],
        "short lived",
    );
    let ev_path = dir.path().join("ev.json");
    fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "ingest", ev_path.to_str().unwrap()])
        .assert()
        .success();

    Command::cargo_bin("quarry")
        .unwrap()
        .args(["--env", &env_path, "sweep"])
        .assert()
        .success();
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("quarry")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init", "ingest", "serve", "verify", "sweep"] {
        assert!(text.contains(cmd), "missing {cmd}");
    }
}
