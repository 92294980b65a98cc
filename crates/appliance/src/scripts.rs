//! Appliance-side script templates

use cfme_common::VMDB_ROOT;

/// Library path required by the appliance console scripts
pub const MIQ_LIB: &str = "/var/www/miq/lib";

/// Marker printed by the config loader after a successful save
pub const CONFIG_LOADED_MARKER: &str = "CONFIG_LOADED";

/// Data directory of the postgres collection on the appliance
pub const PG_DATA: &str = "/opt/rh/postgresql92/root/var/lib/pgsql/data";

/// Quote `value` as a single-quoted ruby string literal
pub fn ruby_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Rails runner script loading the YAML at `config_file` as configuration `config_name`
pub fn config_loader(config_name: &str, config_file: &str) -> String {
    format!(
        "require 'yaml'\n\
         data = YAML.load_file({file})\n\
         config = VMDB::Config.new({name})\n\
         config.config = data\n\
         config.save\n\
         puts {marker}\n",
        file = ruby_quote(config_file),
        name = ruby_quote(config_name),
        marker = ruby_quote(CONFIG_LOADED_MARKER),
    )
}

/// Parameters of the external database used by the enablement script
#[derive(Debug, Clone)]
pub struct ExternalDbScript<'a> {
    pub host: &'a str,
    pub database: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

/// Ruby enablement script for appliances without `appliance_console_cli`
pub fn enable_db(region: u32, external: Option<&ExternalDbScript<'_>>) -> String {
    let mut script = format!(
        "$LOAD_PATH.push({lib})\n\
         require 'appliance_console/env'\n\
         require 'appliance_console/database_configuration'\n",
        lib = ruby_quote(MIQ_LIB)
    );
    match external {
        None => script.push_str(&format!(
            "require 'appliance_console/internal_database_configuration'\n\
             config = ApplianceConsole::InternalDatabaseConfiguration.new(\
             :region => {region}, :interactive => false)\n"
        )),
        Some(db) => script.push_str(&format!(
            "require 'appliance_console/external_database_configuration'\n\
             config = ApplianceConsole::ExternalDatabaseConfiguration.new(\
             :host => {host}, :database => {database}, :region => {region}, \
             :username => {username}, :password => {password}, :interactive => false)\n",
            host = ruby_quote(db.host),
            database = ruby_quote(db.database),
            username = ruby_quote(db.username),
            password = ruby_quote(db.password),
        )),
    }
    script.push_str("exit(config.activate ? 0 : 1)\n");
    script
}

/// Shell command writing a yum repository file for `url`
pub fn yum_repo(repo_id: &str, url: &str) -> String {
    format!(
        "cat > /etc/yum.repos.d/{id}.repo <<EOF\n\
         [update-{id}]\n\
         name=update-url-{id}\n\
         baseurl={url}\n\
         enabled=1\n\
         gpgcheck=0\n\
         EOF\n",
        id = repo_id,
        url = url
    )
}

/// Shell command rewriting `pg_hba.conf` to accept password logins from anywhere
pub fn pg_hba(with_ssl: bool) -> String {
    let ssl = if with_ssl {
        "hostssl all all all cert map=sslmap"
    } else {
        ""
    };
    format!(
        "cat > {data}/pg_hba.conf <<EOF\n\
         local all postgres,root trust\n\
         host all all 0.0.0.0/0 md5\n\
         {ssl}\n\
         EOF\n",
        data = PG_DATA,
        ssl = ssl
    )
}

/// `appliance_console_cli` invocation for an internal database
pub fn cli_internal_db(region: u32, key_address: Option<&str>, db_password: &str, ssh_password: &str) -> String {
    match key_address {
        Some(key_address) => format!(
            "appliance_console_cli --region {} --internal --fetch-key {} -p {} -a {}",
            region,
            key_address,
            shell_words::quote(db_password),
            shell_words::quote(ssh_password)
        ),
        None => format!(
            "appliance_console_cli --region {} --internal --force-key -p {}",
            region,
            shell_words::quote(db_password)
        ),
    }
}

/// `appliance_console_cli` invocation for an external database
pub fn cli_external_db(region: u32, db: &ExternalDbScript<'_>) -> String {
    format!(
        "appliance_console_cli --hostname {} --region {} --dbname {} --username {} --password {}",
        db.host,
        region,
        shell_words::quote(db.database),
        shell_words::quote(db.username),
        shell_words::quote(db.password)
    )
}

/// Location of the database encryption key
pub fn v2_key_path() -> String {
    format!("{}/certs/v2_key", VMDB_ROOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ruby_quote_escapes() {
        assert_eq!(ruby_quote("plain"), "'plain'");
        assert_eq!(ruby_quote("it's"), r"'it\'s'");
        assert_eq!(ruby_quote(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_config_loader_names_file_and_config() {
        let script = config_loader("vmdb", "/tmp/conf.yaml");
        assert!(script.contains("YAML.load_file('/tmp/conf.yaml')"));
        assert!(script.contains("VMDB::Config.new('vmdb')"));
        assert!(script.ends_with("puts 'CONFIG_LOADED'\n"));
    }

    #[test]
    fn test_enable_db_flavors() {
        let internal = enable_db(3, None);
        assert!(internal.contains("InternalDatabaseConfiguration.new(:region => 3"));

        let external = enable_db(
            0,
            Some(&ExternalDbScript {
                host: "10.0.0.1",
                database: "vmdb_production",
                username: "root",
                password: "smartvm",
            }),
        );
        assert!(external.contains(":host => '10.0.0.1'"));
        assert!(external.contains("exit(config.activate ? 0 : 1)"));
    }

    #[test]
    fn test_cli_internal_db() {
        assert_eq!(
            cli_internal_db(1, None, "pw", "ssh"),
            "appliance_console_cli --region 1 --internal --force-key -p pw"
        );
        assert_eq!(
            cli_internal_db(0, Some("10.0.0.9"), "pw", "ssh pw"),
            "appliance_console_cli --region 0 --internal --fetch-key 10.0.0.9 -p pw -a 'ssh pw'"
        );
    }

    #[test]
    fn test_yum_repo() {
        let cmd = yum_repo("abc12345", "http://repo/rhel");
        assert!(cmd.starts_with("cat > /etc/yum.repos.d/abc12345.repo <<EOF\n"));
        assert!(cmd.contains("baseurl=http://repo/rhel\n"));
        assert!(cmd.ends_with("EOF\n"));
    }
}
