//! Provisioning and default bring-up against the lab

use cfme_appliance::{CustomConfigure, ProvisionRequest, DEFAULT_NAME};
use cfme_common::{AppliancePhase, Error, Vmdb};
use cfme_e2e::{init_tracing, Lab};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn provision_and_configure_5_3() {
    init_tracing();
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-5327", "5.3.2.7");
    let ctx = lab.context();
    let provisioner = lab.provisioner(ctx);

    let appliance = provisioner
        .provision(ProvisionRequest::version("5.3.2.7"))
        .await
        .unwrap();
    assert!(appliance.vm_name().starts_with("cfme_5327_"));
    assert!(appliance.does_vm_exist().await.unwrap());

    appliance.configure(None).await.unwrap();

    let ipapp = appliance.ipapp().await.unwrap();
    assert_eq!(ipapp.phase(), AppliancePhase::Configured);
    ipapp
        .wait_for_web_ui(Duration::from_secs(900), true)
        .await
        .unwrap();
    assert_eq!(ipapp.db_address().await.unwrap(), ipapp.address());

    let db = ipapp.db().await.unwrap();
    assert_eq!(db.address(), ipapp.address());
    assert_eq!(
        db.fetch_column("SELECT version FROM miq_servers").await.unwrap(),
        vec!["5.3.2.7".to_string()]
    );

    let commands = lab.commands(ipapp.address());
    let position = |prefix: &str| {
        commands
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("{} was never run", prefix))
    };
    assert!(position("yum update") < position("appliance_console_cli --region 0 --internal"));
    assert!(position("reboot") < position("appliance_console_cli"));
    assert!(commands.iter().any(|c| c.contains("evm:automate:import")));
    assert!(lab
        .host(ipapp.address())
        .unwrap()
        .files
        .contains_key("/etc/init.d/merkyl"));
}

#[tokio::test(start_paused = true)]
async fn configure_5_2_skips_domain_clone() {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-5258", "5.2.5.8");
    let provisioner = lab.provisioner(lab.context());

    let appliance = provisioner
        .provision(ProvisionRequest::version("5.2.5.8"))
        .await
        .unwrap();
    appliance.configure(None).await.unwrap();

    let address = appliance.address().await.unwrap();
    let commands = lab.commands(address);
    assert!(commands.iter().any(|c| c == "yum update -y --nogpgcheck --skip-broken"));
    assert!(commands.iter().any(|c| c == "ntpdate clock.lab"));
    assert!(!commands.iter().any(|c| c.contains("evm:automate")));
    assert!(!commands.iter().any(|c| c.contains("pg_hba.conf")));
}

#[tokio::test(start_paused = true)]
async fn rename_restarts_evm() {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-5327", "5.3.2.7");
    let provisioner = lab.provisioner(lab.context());
    let appliance = provisioner
        .provision(ProvisionRequest::version("5.3.2.7"))
        .await
        .unwrap();
    appliance.configure(None).await.unwrap();
    assert_eq!(appliance.name(), DEFAULT_NAME);

    appliance
        .configure(Some(&CustomConfigure::named("EVM2")))
        .await
        .unwrap();
    assert_eq!(appliance.name(), "EVM2");

    let ipapp = appliance.ipapp().await.unwrap();
    ipapp
        .wait_for_web_ui(Duration::from_secs(900), true)
        .await
        .unwrap();
    let vmdb = ipapp.get_yaml("vmdb").await.unwrap();
    assert_eq!(vmdb["server"]["name"].as_str(), Some("EVM2"));
    assert_eq!(
        ipapp
            .db()
            .await
            .unwrap()
            .fetch_column("SELECT name FROM miq_servers")
            .await
            .unwrap(),
        vec!["EVM2".to_string()]
    );

    let commands = lab.commands(ipapp.address());
    let load = commands
        .iter()
        .rposition(|c| c.contains("bin/rails runner"))
        .unwrap();
    let restart = commands
        .iter()
        .rposition(|c| c == "service evmserverd restart")
        .unwrap();
    assert!(load < restart);
}

#[tokio::test(start_paused = true)]
async fn same_name_does_not_restart() {
    let lab = Lab::new().unwrap();
    lab.add_host("10.0.0.1", "5.3.2.7");
    let ctx = lab.context();
    let ipapp = lab.ipapp(&ctx, "10.0.0.1");

    let renamed = cfme_appliance::configure(&ipapp, Some(&CustomConfigure::named("EVM")), "EVM")
        .await
        .unwrap();
    assert_eq!(renamed, None);
    assert!(!lab
        .commands("10.0.0.1")
        .iter()
        .any(|c| c.contains("bin/rails runner")));
}

#[tokio::test(start_paused = true)]
async fn web_ui_timeout_leaves_appliance_usable() {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-5327", "5.3.2.7");
    let provisioner = lab.provisioner(lab.context());
    let appliance = provisioner
        .provision(ProvisionRequest::version("5.3.2.7"))
        .await
        .unwrap();
    appliance.configure(None).await.unwrap();
    let ipapp = appliance.ipapp().await.unwrap();

    lab.stop_evm(ipapp.address());
    let err = ipapp
        .wait_for_web_ui(Duration::from_secs(30), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Readiness { .. }));
    assert_eq!(err.readiness_condition(), Some("web_ui"));

    ipapp.start_evm_service().await.unwrap();
    ipapp
        .wait_for_web_ui(Duration::from_secs(30), true)
        .await
        .unwrap();

    appliance.destroy().await.unwrap();
    assert!(!appliance.does_vm_exist().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn unknown_version_is_lookup_error() {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-5327", "5.3.2.7");
    let provisioner = lab.provisioner(lab.context());

    let err = provisioner
        .provision(ProvisionRequest::version("5.4.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigLookup(_)));
    assert!(lab.with_state(|state| state.deployments.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn explicit_template_and_cluster() {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-nightly", "master");
    let provisioner = lab.provisioner(lab.context());

    let appliance = provisioner
        .provision(ProvisionRequest::template("cfme-nightly").vm_name("nightly"))
        .await
        .unwrap();
    assert_eq!(appliance.vm_name(), "nightly");
    assert!(appliance.version().await.unwrap().is_latest());

    let deployments = lab.with_state(|state| state.deployments.clone());
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].0, "cfme-nightly");
    assert_eq!(deployments[0].1.cluster.as_deref(), Some("lab-cluster"));
}
