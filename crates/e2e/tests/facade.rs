//! Client caching, readiness and diagnosis on a single appliance

use cfme_common::{AppliancePhase, Service, VersionTag};
use cfme_e2e::Lab;
use std::time::Duration;

async fn configured(lab: &Lab, ctx: &std::sync::Arc<cfme_common::Context>) -> cfme_appliance::IPAppliance {
    lab.add_host("10.0.0.1", "5.3.2.7");
    let ipapp = lab.ipapp(ctx, "10.0.0.1");
    ipapp.enable_internal_db(0).await.unwrap();
    ipapp.wait_for_db(Duration::from_secs(180)).await.unwrap();
    ipapp
}

#[tokio::test(start_paused = true)]
async fn web_stays_up_after_restart() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    ipapp.restart_evm_service(false).await.unwrap();
    assert_eq!(ipapp.phase(), AppliancePhase::DbReady);
    ipapp
        .wait_for_web_ui(Duration::from_secs(900), true)
        .await
        .unwrap();
    assert_eq!(ipapp.phase(), AppliancePhase::WebReady);
    for _ in 0..5 {
        assert!(ipapp.is_web_running(false).await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn web_unsure_without_database() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.set_db_online("10.0.0.1", false);
    assert!(!ipapp.is_web_running(true).await.unwrap());
    ipapp
        .wait_for_web_ui(Duration::from_secs(60), false)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn port_change_reconnects_on_new_port() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;
    assert_eq!(ipapp.version().await.unwrap(), VersionTag::parse("5.3.2.7").unwrap());
    assert_eq!(lab.host("10.0.0.1").unwrap().connections, vec![22]);

    lab.set_ssh_port("10.0.0.1", 2222);
    ctx.ports.set(Service::Ssh, 2222);
    ipapp.guid().await.unwrap();
    assert_eq!(lab.host("10.0.0.1").unwrap().connections, vec![22, 2222]);

    // Setting the same port again keeps the cached shell
    ctx.ports.set(Service::Ssh, 2222);
    ipapp.region().await.unwrap();
    assert_eq!(lab.host("10.0.0.1").unwrap().connections, vec![22, 2222]);
}

#[tokio::test(start_paused = true)]
async fn stale_port_fails_fast_after_change() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    ctx.ports.set(Service::Ssh, 2222);
    let err = ipapp.region().await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!ipapp.is_ssh_running().await);
}

#[tokio::test(start_paused = true)]
async fn ssh_wait_reaches_reachable() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    lab.add_host("10.0.0.1", "5.3.2.7");
    let ipapp = lab.ipapp(&ctx, "10.0.0.1");
    assert_eq!(ipapp.phase(), AppliancePhase::Unreachable);
    ipapp.wait_for_ssh(Duration::from_secs(60)).await.unwrap();
    assert_eq!(ipapp.phase(), AppliancePhase::Reachable);

    let unknown = lab.ipapp(&ctx, "10.0.0.9");
    let err = unknown.wait_for_ssh(Duration::from_secs(30)).await.unwrap_err();
    assert_eq!(err.readiness_condition(), Some("ssh"));
}

#[tokio::test(start_paused = true)]
async fn reboot_waits_for_uptime_reset() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    ipapp.reboot(true).await.unwrap();
    assert!(lab.commands("10.0.0.1").iter().any(|c| c == "reboot"));
    assert!(lab.host("10.0.0.1").unwrap().uptime() < Duration::from_secs(600));
    assert_eq!(ipapp.phase(), AppliancePhase::WebReady);
}

#[tokio::test(start_paused = true)]
async fn diagnose_healthy_appliance() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;
    assert_eq!(ipapp.diagnose_evm_failure().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn diagnose_stopped_postgres() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.set_db_online("10.0.0.1", false);
    let problem = ipapp.diagnose_evm_failure().await.unwrap().unwrap();
    assert_eq!(problem, "postgres was not running for unknown reasons");
    assert!(lab.database("10.0.0.1").unwrap().online);
}

#[tokio::test(start_paused = true)]
async fn diagnose_postgres_that_will_not_start() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.set_db_online("10.0.0.1", false);
    lab.fail_commands("10.0.0.1", "service postgresql92-postgresql restart");
    let problem = ipapp.diagnose_evm_failure().await.unwrap().unwrap();
    assert!(problem.starts_with("postgres failed to start:"));
}

#[tokio::test(start_paused = true)]
async fn diagnose_unmigrated_database() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.with_state(|state| {
        if let Some(db) = state.databases.get_mut("10.0.0.1") {
            db.migrated = false;
        }
    });
    let problem = ipapp.diagnose_evm_failure().await.unwrap().unwrap();
    assert_eq!(problem, "vmdb_production has no tables");
}

#[tokio::test(start_paused = true)]
async fn diagnose_evm_start_failure() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.fail_commands("10.0.0.1", "service evmserverd restart");
    let problem = ipapp.diagnose_evm_failure().await.unwrap().unwrap();
    assert!(problem.starts_with("evmserverd failed to start:"));
    assert!(problem.contains("simulated failure"));
}

#[tokio::test(start_paused = true)]
async fn diagnose_unreachable_appliance() {
    let lab = Lab::new().unwrap();
    let ctx = lab.context();
    let ipapp = configured(&lab, &ctx).await;

    lab.with_state(|state| {
        if let Some(host) = state.hosts.get_mut("10.0.0.1") {
            host.powered = false;
        }
    });
    let problem = ipapp.diagnose_evm_failure().await.unwrap().unwrap();
    assert_eq!(problem, "SSH is not running on the appliance");
}
