use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;

/// Upstream source-control operations used by label tools and secret sync.
#[async_trait]
pub trait SourceControlClient: Send + Sync {
    async fn list_issue_labels(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
    ) -> anyhow::Result<Vec<String>>;

    async fn add_issue_labels(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        labels: &[String],
    ) -> anyhow::Result<Vec<String>>;

    async fn remove_issue_label(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        label: &str,
    ) -> anyhow::Result<()>;

    async fn upsert_environment_secret(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        environment: &str,
        secret_name: &str,
        secret_value: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

/// Create-if-absent / drop-if-present primitives; the bool reports whether anything changed.
#[async_trait]
pub trait DatabaseLifecycleClient: Send + Sync {
    async fn ensure_database(&self, environment: &str, name: &str) -> anyhow::Result<bool>;
    async fn drop_database(&self, environment: &str, name: &str) -> anyhow::Result<bool>;
    async fn database_exists(&self, environment: &str, name: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct Clients {
    pub source_control: Arc<dyn SourceControlClient>,
    pub cluster: Arc<dyn ClusterClient>,
    pub databases: Arc<dyn DatabaseLifecycleClient>,
}

impl Clients {
    pub fn simulated() -> Self {
        Self {
            source_control: Arc::new(SimulatedSourceControl::default()),
            cluster: Arc::new(SimulatedCluster::default()),
            databases: Arc::new(SimulatedDatabases::default()),
        }
    }
}

#[derive(Default)]
pub struct SimulatedSourceControl {
    labels: Mutex<HashMap<(String, i64), BTreeSet<String>>>,
    secrets: Mutex<HashMap<(String, String, String), String>>,
}

impl SimulatedSourceControl {
    pub fn environment_secret(
        &self,
        repo_full_name: &str,
        environment: &str,
        name: &str,
    ) -> Option<String> {
        self.secrets.lock().ok().and_then(|secrets| {
            secrets
                .get(&(repo_full_name.to_string(), environment.to_string(), name.to_string()))
                .cloned()
        })
    }
}

#[async_trait]
impl SourceControlClient for SimulatedSourceControl {
    async fn list_issue_labels(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
    ) -> anyhow::Result<Vec<String>> {
        let labels = self.labels.lock().map_err(|_| anyhow!("label store poisoned"))?;
        Ok(labels
            .get(&(format!("{owner}/{repo}"), issue_number))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_issue_labels(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        labels: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let mut store = self.labels.lock().map_err(|_| anyhow!("label store poisoned"))?;
        let entry = store.entry((format!("{owner}/{repo}"), issue_number)).or_default();
        entry.extend(labels.iter().cloned());
        Ok(entry.iter().cloned().collect())
    }

    async fn remove_issue_label(
        &self,
        _token: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        label: &str,
    ) -> anyhow::Result<()> {
        let mut store = self.labels.lock().map_err(|_| anyhow!("label store poisoned"))?;
        if let Some(entry) = store.get_mut(&(format!("{owner}/{repo}"), issue_number)) {
            entry.remove(label);
        }
        Ok(())
    }

    async fn upsert_environment_secret(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        environment: &str,
        secret_name: &str,
        secret_value: &str,
    ) -> anyhow::Result<()> {
        if token.is_empty() {
            bail!("repository token is empty");
        }
        let mut secrets = self.secrets.lock().map_err(|_| anyhow!("secret store poisoned"))?;
        secrets.insert(
            (format!("{owner}/{repo}"), environment.to_string(), secret_name.to_string()),
            secret_value.to_string(),
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct SimulatedCluster {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, String>>>,
    unavailable: bool,
}

impl SimulatedCluster {
    /// A cluster whose API rejects every write.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.secrets
            .lock()
            .ok()
            .and_then(|secrets| secrets.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

#[async_trait]
impl ClusterClient for SimulatedCluster {
    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        if self.unavailable {
            bail!("kubernetes api unavailable");
        }
        let mut secrets = self.secrets.lock().map_err(|_| anyhow!("secret store poisoned"))?;
        secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[derive(Default)]
pub struct SimulatedDatabases {
    databases: Mutex<BTreeSet<(String, String)>>,
}

#[async_trait]
impl DatabaseLifecycleClient for SimulatedDatabases {
    async fn ensure_database(&self, environment: &str, name: &str) -> anyhow::Result<bool> {
        let mut databases = self
            .databases
            .lock()
            .map_err(|_| anyhow!("database registry poisoned"))?;
        Ok(databases.insert((environment.to_string(), name.to_string())))
    }

    async fn drop_database(&self, environment: &str, name: &str) -> anyhow::Result<bool> {
        let mut databases = self
            .databases
            .lock()
            .map_err(|_| anyhow!("database registry poisoned"))?;
        Ok(databases.remove(&(environment.to_string(), name.to_string())))
    }

    async fn database_exists(&self, environment: &str, name: &str) -> anyhow::Result<bool> {
        let databases = self.databases.lock().map_err(|_| anyhow!("database registry poisoned"))?;
        Ok(databases.contains(&(environment.to_string(), name.to_string())))
    }
}
