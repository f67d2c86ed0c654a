//! Connection coordinates of the shared server and of individual databases.

use serde::{Deserialize, Serialize};

/// Where a server process can be reached, from the host and from its private network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCoordinates {
    /// Externally reachable host.
    pub host: String,
    /// Externally reachable (mapped) port.
    pub port: u16,
    /// Host name on the private network (the container name).
    pub network_host: String,
    /// Port on the private network.
    pub network_port: u16,
    pub username: String,
    pub password: String,
}

impl ServerCoordinates {
    /// External connection URL for `database`.
    pub fn url(&self, database: &str) -> String {
        format_url(&self.username, &self.password, &self.host, self.port, database)
    }

    /// In-network connection URL for `database`.
    pub fn network_url(&self, database: &str) -> String {
        format_url(
            &self.username,
            &self.password,
            &self.network_host,
            self.network_port,
            database,
        )
    }
}

fn format_url(username: &str, password: &str, host: &str, port: u16, database: &str) -> String {
    if password.is_empty() {
        format!("postgresql://{username}@{host}:{port}/{database}")
    } else {
        format!("postgresql://{username}:{password}@{host}:{port}/{database}")
    }
}

/// Everything a calling context needs to reach one database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub connection_string: String,
    /// Connection string usable from a sibling container on the private network.
    pub connection_string_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_connection_string_network: Option<String>,
    pub network_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl ConnectionDetails {
    pub fn new(
        server: &ServerCoordinates,
        proxy: Option<&ServerCoordinates>,
        network_id: &str,
        database: &str,
    ) -> Self {
        Self {
            connection_string: server.url(database),
            connection_string_network: server.network_url(database),
            proxy_connection_string: proxy.map(|p| p.url(database)),
            proxy_connection_string_network: proxy.map(|p| p.network_url(database)),
            network_id: network_id.to_string(),
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            password: server.password.clone(),
            database: database.to_string(),
        }
    }
}
