//! Configuration documents written through the appliance loader

use cfme_common::{Error, SERVER_CONFIG_CHANGED};
use cfme_e2e::Lab;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn configured(lab: &Lab, ctx: &Arc<cfme_common::Context>) -> cfme_appliance::IPAppliance {
    lab.add_host("10.0.0.1", "5.3.2.7");
    let ipapp = lab.ipapp(ctx, "10.0.0.1");
    ipapp.enable_internal_db(0).await.unwrap();
    ipapp.wait_for_db(Duration::from_secs(180)).await.unwrap();
    ipapp
}

#[tokio::test(start_paused = true)]
async fn set_then_get_round_trips() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let handle = ctx.signals.register(SERVER_CONFIG_CHANGED, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let mut vmdb = ipapp.get_yaml("vmdb").await.unwrap();
    vmdb["server"]["name"] = "X".into();
    ipapp.set_yaml("vmdb", &vmdb).await.unwrap();

    let read_back = ipapp.get_yaml("vmdb").await.unwrap();
    assert_eq!(read_back["server"]["name"].as_str(), Some("X"));
    assert_eq!(read_back, vmdb);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    ctx.signals.unregister(handle);

    // Loader artifacts landed where the rails runner reads them
    let host = lab.host("10.0.0.1").unwrap();
    assert!(host.files.contains_key("/tmp/conf.yaml"));
    assert!(host.files.contains_key("/tmp/load_conf.rb"));
}

#[tokio::test(start_paused = true)]
async fn loader_failure_is_step_error_without_signal() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    ctx.signals.register(SERVER_CONFIG_CHANGED, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    lab.fail_commands("10.0.0.1", "cd /var/www/miq/vmdb; bin/rails runner");
    let vmdb = ipapp.get_yaml("vmdb").await.unwrap();
    let err = ipapp.set_yaml("vmdb", &vmdb).await.unwrap_err();
    match err {
        Error::ShellStep { step, .. } => assert_eq!(step, "load configuration vmdb"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn session_timeout_written_only_on_change() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    assert!(!ipapp.set_session_timeout(3600).await.unwrap());
    assert!(ipapp.set_session_timeout(7200).await.unwrap());
    let vmdb = ipapp.get_yaml("vmdb").await.unwrap();
    assert_eq!(vmdb["session"]["timeout"].as_u64(), Some(7200));

    let loads = lab
        .commands("10.0.0.1")
        .iter()
        .filter(|c| c.contains("bin/rails runner"))
        .count();
    assert_eq!(loads, 1);
}

#[tokio::test(start_paused = true)]
async fn server_name_visible_after_restart() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    assert_eq!(ipapp.server_name().await.unwrap().as_deref(), Some("EVM"));
    ipapp.rename_server("Lab Server").await.unwrap();
    ipapp
        .wait_for_server_name("Lab Server", Duration::from_secs(60))
        .await
        .unwrap();

    // The server row follows once evm restarts
    let name = lab.database("10.0.0.1").unwrap().servers[0].name.clone();
    assert_eq!(name, "EVM");
    ipapp.restart_evm_service(false).await.unwrap();
    let name = lab.database("10.0.0.1").unwrap().servers[0].name.clone();
    assert_eq!(name, "Lab Server");
}

#[tokio::test(start_paused = true)]
async fn missing_document_is_lookup_error() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    let err = ipapp.get_yaml("event_handling").await.unwrap_err();
    assert!(matches!(err, Error::ConfigLookup(_)));
}
