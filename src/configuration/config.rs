#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::path;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use clap::ArgMatches;
use clap::Command;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use strum::EnumIter;
use strum::EnumVariantNames;
use strum::IntoEnumIterator;
use tokio::fs;

static CONFIG: Lazy<DashMap<String, String>> = Lazy::new(DashMap::new);

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumIter, EnumVariantNames, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConfigKey {
    BaseURL,
    ConfigFile,
    CsrfPath,
    GeneralUploadPath,
    ProjectUploadPath,
    RefreshPath,
    RequestTimeout,
    SignInURL,
}

pub struct Config {}

impl Config {
    pub fn get(key: ConfigKey) -> String {
        if let Some(val) = CONFIG.get(&key.to_string()) {
            return val.to_string();
        }

        return "".to_string();
    }

    pub fn set(key: ConfigKey, value: &str) {
        CONFIG.insert(key.to_string(), value.to_string());
    }

    /// Request timeout for JSON calls. Zero or an unparsable value disables it.
    pub fn request_timeout() -> Option<Duration> {
        let millis = Config::get(ConfigKey::RequestTimeout)
            .parse::<u64>()
            .unwrap_or(0);
        if millis == 0 {
            return None;
        }

        return Some(Duration::from_millis(millis));
    }

    pub fn default(key: ConfigKey) -> String {
        #[cfg(not(target_os = "macos"))]
        let config_path = dirs::config_dir()
            .unwrap_or_else(|| return path::PathBuf::from("."))
            .join("airdesk/config.toml");
        #[cfg(target_os = "macos")]
        let config_path = path::PathBuf::from(std::env::var("HOME").unwrap_or_default())
            .join(".config/airdesk/config.toml");

        let config_path = config_path.to_string_lossy().to_string();

        let res = match key {
            ConfigKey::BaseURL => "http://localhost:8080/api",
            ConfigKey::CsrfPath => "/auth/csrf-token",
            ConfigKey::GeneralUploadPath => "/documents",
            ConfigKey::ProjectUploadPath => "/projects/{project}/documents",
            ConfigKey::RefreshPath => "/auth/refresh",
            ConfigKey::RequestTimeout => "30000",
            ConfigKey::SignInURL => "/sign-in",

            // Special
            ConfigKey::ConfigFile => &config_path,
        };

        return res.to_string();
    }

    pub async fn load(clap_arg_matches: Vec<&ArgMatches>) -> Result<()> {
        for key in ConfigKey::iter() {
            Config::set(key, &Config::default(key))
        }

        let mut config_file = Config::default(ConfigKey::ConfigFile);
        for matches in clap_arg_matches.as_slice() {
            if let Ok(Some(arg_config_file)) =
                matches.try_get_one::<String>(&ConfigKey::ConfigFile.to_string())
            {
                config_file = arg_config_file.to_string();
            }
        }

        let config_path = path::PathBuf::from(config_file);
        if config_path.exists() {
            let toml_str = fs::read_to_string(config_path).await?;
            Config::load_toml(&toml_str)?;
        }

        for key in ConfigKey::iter() {
            for matches in clap_arg_matches.as_slice() {
                if let Ok(Some(val)) = matches.try_get_one::<String>(&key.to_string()) {
                    if val.is_empty() {
                        continue;
                    }
                    Config::set(key, val)
                }
            }
        }

        tracing::debug!(
            base_url = %Config::get(ConfigKey::BaseURL),
            csrf_path = %Config::get(ConfigKey::CsrfPath),
            refresh_path = %Config::get(ConfigKey::RefreshPath),
            request_timeout = %Config::get(ConfigKey::RequestTimeout),
            "config"
        );

        return Ok(());
    }

    fn load_toml(toml_str: &str) -> Result<()> {
        let doc = toml_str.parse::<toml_edit::Document>()?;

        for key in ConfigKey::iter() {
            let Some(val) = doc.get(&key.to_string()) else {
                continue;
            };

            if let Some(val_int) = val.as_integer() {
                if val_int < 0 {
                    bail!(format!(
                        "config.toml has a negative value for key '{key}': {val_int}"
                    ));
                }
                Config::set(key, &val_int.to_string());
            } else if let Some(val_str) = val.as_str() {
                if val_str.is_empty() {
                    continue;
                }
                if key == ConfigKey::RequestTimeout && val_str.parse::<u64>().is_err() {
                    bail!(format!(
                        "config.toml has an invalid value for key '{key}': {val_str}\nExpected a number of milliseconds"
                    ));
                }
                Config::set(key, val_str);
            } else {
                bail!(format!(
                    "config.toml has an unsupported value type for key '{key}'"
                ));
            }
        }

        return Ok(());
    }

    pub fn serialize_default(cmd: Command) -> String {
        let toml_str = ConfigKey::iter()
            .filter_map(|key| {
                if key == ConfigKey::ConfigFile {
                    return None;
                }

                let arg = cmd
                    .get_arguments()
                    .find(|e| return e.get_long() == Some(key.to_string().as_str()))?;

                let mut description = arg
                    .get_help()
                    .map(|help| return help.to_string())
                    .unwrap_or_default();

                description = description
                    .split("[default:")
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();

                let mut val = Config::default(key);
                if val.is_empty() {
                    val = format!("# {key} = \"\"");
                } else if val.parse::<i64>().is_ok() {
                    val = format!("{key} = {val}");
                } else {
                    val = format!("{key} = \"{val}\"");
                }

                return Some(format!("# {description}\n{val}"));
            })
            .collect::<Vec<String>>()
            .join("\n\n");

        return toml_str;
    }
}
