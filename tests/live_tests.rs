// Live tests against a real cluster. Ignored by default - they create and
// destroy real instances! 🔥
//
// APP_PROXMOX__BASE_URL=https://pve.lab:8006/api2/json \
// APP_PROXMOX__TOKEN_ID='root@pam!ci' APP_PROXMOX__TOKEN_SECRET=... \
// LIVE_TEMPLATE=ubuntu-22 cargo test --test live_tests -- --ignored

use std::sync::Arc;
use tracing::info;

use proxmox_provisioner::config::Settings;
use proxmox_provisioner::core::lifecycle::{InstanceKind, InstanceLifecycle};
use proxmox_provisioner::core::vm::VmSpec;
use proxmox_provisioner::{ProvisionError, Provisioner, ProxmoxClient};

fn live_provisioner() -> anyhow::Result<(Provisioner, Settings)> {
    let settings = Settings::new()?;
    let client = ProxmoxClient::new(&settings.proxmox)?;
    Ok((Provisioner::new(Arc::new(client), &settings), settings))
}

// Read-only: the catalog should at least see some storage and a bridge
#[tokio::test]
#[ignore]
async fn test_live_catalog() -> anyhow::Result<()> {
    let (engine, settings) = live_provisioner()?;
    let catalog = engine.fetch_catalog(&settings.proxmox.node).await?;
    info!(?catalog, "Live catalog");

    assert!(!catalog.storage.is_empty(), "no storage visible");
    assert!(!catalog.bridges.is_empty(), "no bridges visible");
    Ok(())
}

// Bogus storage must be rejected before anything is created
#[tokio::test]
#[ignore]
async fn test_live_rejects_unknown_storage() -> anyhow::Result<()> {
    let (engine, _) = live_provisioner()?;
    let err = engine
        .provision_vm(VmSpec {
            disk: Some("definitely-not-a-pool:8".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::StorageNotFound { .. }), "{err}");
    Ok(())
}

// Full clone round trip, cleaned up afterwards
#[tokio::test]
#[ignore]
async fn test_live_template_clone() -> anyhow::Result<()> {
    let Ok(template) = std::env::var("LIVE_TEMPLATE") else {
        info!("LIVE_TEMPLATE not set, skipping");
        return Ok(());
    };
    let (engine, settings) = live_provisioner()?;
    let node = settings.proxmox.node.clone();

    let outcome = engine
        .provision_vm(VmSpec {
            name: Some("provisioner-live-test".into()),
            template: Some(template),
            cores: Some(2),
            memory: Some(2048),
            ..Default::default()
        })
        .await?;
    info!(vmid = outcome.vmid, "Cloned");

    let lifecycle = InstanceLifecycle::new(engine.api());
    let status = lifecycle.get(&node, InstanceKind::Vm, outcome.vmid).await?;
    assert!(status.get("status").is_some());

    lifecycle.delete(&node, InstanceKind::Vm, outcome.vmid).await?;
    Ok(())
}
