//! TLS material loading.

mod common;

use common::write_tls_materials;
use jobstats::net::{build_tls_config, load_private_key, read_ca_pem, TlsFiles};
use std::fs;
use tempfile::TempDir;

#[test]
fn full_material_builds_client_auth_config() {
    let dir = TempDir::new().unwrap();
    let tls = write_tls_materials(dir.path());

    let config = build_tls_config(&TlsFiles {
        ca_cert: Some(tls.ca.clone()),
        client_cert: Some(tls.chain.clone()),
        client_key: Some(tls.key.clone()),
    })
    .unwrap();

    assert!(config.client_auth_cert_resolver.has_certs());
}

#[test]
fn ca_only_config_has_no_client_identity() {
    let dir = TempDir::new().unwrap();
    let tls = write_tls_materials(dir.path());

    let config = build_tls_config(&TlsFiles {
        ca_cert: Some(tls.ca),
        ..TlsFiles::default()
    })
    .unwrap();

    assert!(!config.client_auth_cert_resolver.has_certs());
}

#[test]
fn cert_without_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tls = write_tls_materials(dir.path());

    let err = build_tls_config(&TlsFiles {
        client_cert: Some(tls.chain),
        ..TlsFiles::default()
    })
    .unwrap_err();

    assert!(err.to_string().contains("together"), "{err}");
}

#[test]
fn empty_ca_bundle_is_rejected() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty.pem");
    fs::write(&empty, "").unwrap();

    assert!(build_tls_config(&TlsFiles {
        ca_cert: Some(empty.clone()),
        ..TlsFiles::default()
    })
    .is_err());
    assert!(read_ca_pem(&empty).is_err());
}

#[test]
fn read_ca_pem_returns_the_bundle_text() {
    let dir = TempDir::new().unwrap();
    let tls = write_tls_materials(dir.path());

    let pem = read_ca_pem(&tls.ca).unwrap();

    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(read_ca_pem(&tls.key).is_err(), "a key file is not a CA bundle");
}

#[test]
fn private_key_loading() {
    let dir = TempDir::new().unwrap();
    let tls = write_tls_materials(dir.path());
    assert!(load_private_key(&tls.key).is_ok());

    let garbage = dir.path().join("garbage.pem");
    fs::write(&garbage, "not a key").unwrap();
    let err = load_private_key(&garbage).unwrap_err();
    assert!(err.to_string().contains("no supported private key"), "{err}");

    assert!(load_private_key(&dir.path().join("missing.pem")).is_err());
}
