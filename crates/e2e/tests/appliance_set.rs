//! Primary/secondary appliance sets

use cfme_appliance::{provision_appliance_set, ApplianceSet, ApplianceSetSpec, ProvisionRequest};
use cfme_common::{Error, Vmdb};
use cfme_e2e::Lab;

const SET: &str = r#"
primary_appliance:
  name: primary
  version: 5.3.2
secondary_appliances:
  - name: secondary-1
    version: 5.3.2
  - name: secondary-2
    version: 5.2.5
"#;

fn lab() -> Lab {
    let lab = Lab::new().unwrap();
    lab.add_template("cfme-532", "5.3.2");
    lab.add_template("cfme-533", "5.3.3");
    lab.add_template("cfme-525", "5.2.5");
    lab
}

#[tokio::test(start_paused = true)]
async fn set_shares_primary_database() {
    let lab = lab();
    let provisioner = lab.provisioner(lab.context());
    let spec = ApplianceSetSpec::from_yaml(SET).unwrap();

    let set = provision_appliance_set(&provisioner, &spec, "set").await.unwrap();
    assert_eq!(set.secondaries().len(), 2);

    let primary = set.primary().ipapp().await.unwrap();
    assert_eq!(primary.db_address().await.unwrap(), primary.address());
    for secondary in set.secondaries() {
        let ipapp = secondary.ipapp().await.unwrap();
        assert_eq!(ipapp.db_address().await.unwrap(), primary.address());
        assert_eq!(ipapp.db().await.unwrap().address(), primary.address());
    }

    let mut names = primary
        .db()
        .await
        .unwrap()
        .fetch_column("SELECT name FROM miq_servers")
        .await
        .unwrap();
    names.sort();
    assert_eq!(names, vec!["primary", "secondary-1", "secondary-2"]);

    assert_eq!(set.primary().name(), "primary");
    assert!(set.find_by_name("secondary-2").is_some());
    let order: Vec<String> = set.all_appliances().map(|a| a.name()).collect();
    assert_eq!(order, vec!["secondary-1", "secondary-2", "primary"]);
    assert!(lab.database(set.secondaries()[0].address().await.unwrap()).is_none());
}

#[tokio::test(start_paused = true)]
async fn newer_secondary_rejected_before_deploy() {
    let lab = lab();
    let provisioner = lab.provisioner(lab.context());
    let spec = ApplianceSetSpec::from_yaml(
        "primary_appliance: {name: primary, version: 5.2.5}\n\
         secondary_appliances:\n  - {name: secondary, version: 5.3.3}\n",
    )
    .unwrap();

    let err = provision_appliance_set(&provisioner, &spec, "set").await.unwrap_err();
    assert!(matches!(err, Error::Invariant(_)));
    assert!(lab.with_state(|state| state.deployments.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn newer_secondary_rejected_before_db_action() {
    let lab = lab();
    let provisioner = lab.provisioner(lab.context());
    let primary = provisioner
        .provision(ProvisionRequest::version("5.2.5"))
        .await
        .unwrap();
    let secondary = provisioner
        .provision(ProvisionRequest::version("5.3.3"))
        .await
        .unwrap();
    let addresses = [
        primary.address().await.unwrap().to_string(),
        secondary.address().await.unwrap().to_string(),
    ];

    let spec = ApplianceSetSpec::from_yaml(
        "primary_appliance: {name: primary, version: 5.2.5}\n\
         secondary_appliances:\n  - {name: secondary, version: 5.2.5}\n",
    )
    .unwrap();
    let set = ApplianceSet::new(primary, vec![secondary]);
    let err = set.configure(&spec).await.unwrap_err();
    assert!(err.is_invariant());

    for address in &addresses {
        assert!(!lab
            .commands(address)
            .iter()
            .any(|c| c.starts_with("appliance_console_cli") || c.starts_with("psql")));
    }
    assert!(lab.with_state(|state| state.databases.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn name_count_mismatch_is_invariant() {
    let lab = lab();
    let provisioner = lab.provisioner(lab.context());
    let primary = provisioner
        .provision(ProvisionRequest::version("5.3.2"))
        .await
        .unwrap();
    let set = ApplianceSet::new(primary, Vec::new());
    let err = set
        .configure(&ApplianceSetSpec::from_yaml(SET).unwrap())
        .await
        .unwrap_err();
    assert!(err.is_invariant());
}
