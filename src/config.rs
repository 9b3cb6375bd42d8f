//! The client configuration file (~/.mixminionrc).

use crate::prelude::*;
use crate::util::expand_user;
use std::env;
use std::fs;
use std::time::Duration as StdDuration;
use time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ClientConfig {
    pub host: HostConfig,
    pub user: UserConfig,
    pub security: SecurityConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HostConfig {
    /// Command (plus arguments) run to overwrite files before deletion.
    pub shred_command: Option<String>,
    /// Alternate entropy source, e.g. a hardware RNG device.
    pub entropy_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct UserConfig {
    /// Where the client keeps its state.
    pub user_dir: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            user_dir: "~/.mixminion".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Default number of hops on a forward path.
    pub path_length: usize,
    /// Default number of hops on a reply path.
    pub surb_path_length: usize,
    /// Default reply-block validity window, in days.
    pub surb_lifetime: u32,
    /// Default recipient for generated reply blocks.
    pub surb_address: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            path_length: 6,
            surb_path_length: 4,
            surb_lifetime: 7,
            surb_address: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Transport timeout, in seconds.
    pub connection_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connection_timeout: 20,
        }
    }
}

const DEFAULT_CONFIG: &str = "\
# This file contains your options for the mixminion client.

[host]
## Use this option to specify a 'secure remove' command.
#shred-command = \"rm -f\"
## Use this option to specify a nonstandard entropy source.
#entropy-source = \"/dev/urandom\"

[user]
## By default, mixminion puts your files in ~/.mixminion.  You can override
## that directory here.
#user-dir = \"~/.mixminion\"

[security]
path-length = 6
surb-path-length = 4
## How many days generated reply blocks stay usable.
surb-lifetime = 7
## Default recipient for generated reply blocks.
#surb-address = \"<your address here>\"

[network]
## Seconds to wait for a mix server before giving up.
connection-timeout = 20
";

impl ClientConfig {
    /// Load the configuration, looking (in order) at the explicit path from
    /// the command line, $MIXMINIONRC, and ~/.mixminionrc.  A commented
    /// default file is installed when nothing exists at the resolved path.
    pub fn load(explicit: Option<&Path>) -> Result<ClientConfig> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match env::var("MIXMINIONRC") {
                Ok(p) if !p.is_empty() => expand_user(&p),
                _ => expand_user("~/.mixminionrc"),
            },
        };
        if !path.exists() {
            warn!(
                "No configuration file found. Installing default file in {}",
                path.display()
            );
            fs::write(&path, DEFAULT_CONFIG)
                .wrap_err_with(|| format!("couldn't write {}", path.display()))?;
        }
        let text = fs::read_to_string(&path)
            .wrap_err_with(|| format!("couldn't read {}", path.display()))?;
        Self::parse(&text)
            .wrap_err_with(|| format!("error in configuration file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<ClientConfig> {
        Ok(toml_edit::de::from_str(text)?)
    }

    pub fn user_dir(&self) -> PathBuf {
        expand_user(&self.user.user_dir)
    }

    pub fn connection_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.network.connection_timeout)
    }

    pub fn surb_lifetime(&self) -> Duration {
        Duration::days(self.security.surb_lifetime.into())
    }

    pub fn shred_command(&self) -> Option<Vec<String>> {
        let cmd = self.host.shred_command.as_deref()?;
        let words: Vec<String> = cmd.split_whitespace().map(str::to_owned).collect();
        if words.is_empty() {
            None
        } else {
            Some(words)
        }
    }

    pub fn entropy_source(&self) -> Option<PathBuf> {
        self.host.entropy_source.as_deref().map(expand_user)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::parse("").unwrap();
        assert_eq!(config.security.path_length, 6);
        assert_eq!(config.security.surb_path_length, 4);
        assert_eq!(config.surb_lifetime(), Duration::days(7));
        assert_eq!(config.connection_timeout(), StdDuration::from_secs(20));
        assert_eq!(config.user.user_dir, "~/.mixminion");
        assert!(config.shred_command().is_none());
    }

    #[test]
    fn test_default_file_parses() {
        let config = ClientConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.network.connection_timeout, 20);
        assert_eq!(config.security.surb_lifetime, 7);
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::parse(
            "[user]\nuser-dir = \"/tmp/mm\"\n\
             [security]\npath-length = 3\nsurb-address = \"user@example.com\"\n\
             [host]\nshred-command = \"shred -u\"\n",
        )
        .unwrap();
        assert_eq!(config.user_dir(), PathBuf::from("/tmp/mm"));
        assert_eq!(config.security.path_length, 3);
        assert_eq!(
            config.security.surb_address.as_deref(),
            Some("user@example.com")
        );
        assert_eq!(
            config.shred_command(),
            Some(vec!["shred".to_owned(), "-u".to_owned()])
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(ClientConfig::parse("[security]\npathlength = 3\n").is_err());
    }
}
