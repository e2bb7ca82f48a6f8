// Driver Configuration
// Connection parameters and the named data sources a DSN resolves to

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::traits::DatabaseError;

/// What a caller supplies to open a connection.
///
/// A blank `username` selects integrated authentication; `password` is
/// then ignored. Surrounding whitespace in the username is not significant.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub data_source: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)] // Don't serialize password
    pub password: String,
}

impl ConnectionParams {
    pub fn new(
        data_source: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parameters for integrated (trusted) authentication.
    pub fn integrated(data_source: impl Into<String>) -> Self {
        Self::new(data_source, "", "")
    }

    pub fn uses_integrated_security(&self) -> bool {
        self.username.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.data_source.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig(
                "Data source name is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("data_source", &self.data_source)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn default_true() -> bool {
    true
}

/// A named data source: either a server endpoint or a database file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub trust_certificate: bool,
}

impl DataSourceConfig {
    pub const DEFAULT_MSSQL_PORT: u16 = 1433;

    pub fn server(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: Some(host.into()),
            port: Some(port),
            database: Some(database.into()),
            path: None,
            encrypt: false,
            trust_certificate: true,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            host: None,
            port: None,
            database: None,
            path: Some(path.into()),
            encrypt: false,
            trust_certificate: true,
        }
    }

    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or(Self::DEFAULT_MSSQL_PORT)
    }
}

/// Data sources known to a native backend, looked up by DSN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSources {
    #[serde(default)]
    sources: Vec<DataSourceConfig>,
}

impl DataSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: DataSourceConfig) -> Self {
        self.insert(source);
        self
    }

    /// Add a data source, replacing any existing one with the same name.
    pub fn insert(&mut self, source: DataSourceConfig) {
        match self
            .sources
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(&source.name))
        {
            Some(existing) => *existing = source,
            None => self.sources.push(source),
        }
    }

    /// Look up a data source by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&DataSourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, DatabaseError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), DatabaseError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Default location: `datasources.json` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "plugdb", "plugdb")
            .map(|dirs| dirs.config_dir().join("datasources.json"))
    }

    /// Load from the default location; a missing file yields no data sources.
    pub fn load_default() -> Result<Self, DatabaseError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}
