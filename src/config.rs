use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration de l'outil. Toutes les valeurs ont un défaut raisonnable ;
/// un fichier TOML optionnel peut les fournir, la ligne de commande les
/// surcharge.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Paramètres réseau communs aux deux modes
    #[serde(default)]
    pub net: NetConfig,

    /// Cadence et réémissions côté client, timeout d'inactivité côté serveur
    #[serde(default)]
    pub timing: TimingConfig,

    /// Paramètres du mode serveur
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetConfig {
    /// Port UDP (123 = port NTP standard, d'où le camouflage)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Magic 32 bits non nul, partagé hors-bande par les deux extrémités.
    /// Zéro signifie "non configuré" et est rejeté à la validation.
    #[serde(default)]
    pub magic: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimingConfig {
    /// Estimation de base de l'aller-retour, point de départ du backoff
    /// exponentiel (millisecondes)
    #[serde(default = "default_rtt_base_ms")]
    pub rtt_base_ms: u64,

    /// Plafond du backoff exponentiel (millisecondes)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Nombre d'envois d'un Start, End ou Query avant d'abandonner
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,

    /// Nombre de réémissions d'un chunk avant d'abandonner le fichier
    #[serde(default = "default_per_chunk_retries")]
    pub per_chunk_retries: u32,

    /// Fenêtre glissante : chunks non acquittés en vol simultanément
    #[serde(default = "default_window")]
    pub window: usize,

    /// Intervalle minimal entre deux datagrammes sortants, en secondes.
    /// Prime sur toute autre décision d'ordonnancement (0 = désactivé).
    #[serde(default)]
    pub min_interval_secs: f64,

    /// Inactivité au-delà de laquelle le serveur abandonne une session
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Racine de stockage des fichiers reçus ; sa présence sélectionne le
    /// mode serveur
    #[serde(default)]
    pub storage_root: Option<PathBuf>,

    /// Écrase les fichiers homonymes au lieu de suffixer -1, -2, ...
    #[serde(default)]
    pub overwrite: bool,

    /// Adresse d'écoute
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

// Fonctions par défaut pour serde
fn default_port() -> u16 {
    123
}
fn default_rtt_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    8_000
}
fn default_handshake_retries() -> u32 {
    5
}
fn default_per_chunk_retries() -> u32 {
    8
}
fn default_window() -> usize {
    32
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            port: default_port(),
            magic: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            storage_root: None,
            overwrite: false,
            bind_address: default_bind_address(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            rtt_base_ms: default_rtt_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            handshake_retries: default_handshake_retries(),
            per_chunk_retries: default_per_chunk_retries(),
            window: default_window(),
            min_interval_secs: 0.0,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Vue du timing en durées prêtes à l'emploi pour les moteurs
#[derive(Debug, Clone)]
pub struct Tuning {
    pub rtt_base: Duration,
    pub backoff_cap: Duration,
    pub handshake_retries: u32,
    pub per_chunk_retries: u32,
    pub window: usize,
    pub min_interval: Duration,
    pub idle_timeout: Duration,
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Valide la configuration après application des surcharges CLI
    pub fn validate(&self) -> Result<()> {
        if self.net.magic == 0 {
            anyhow::bail!("magic must be a non-zero 32-bit value (use -m <hex>)");
        }

        if self.timing.window == 0 {
            anyhow::bail!("window must be at least 1");
        }

        if self.timing.rtt_base_ms == 0 {
            anyhow::bail!("rtt_base_ms must be at least 1");
        }

        if !(self.timing.min_interval_secs.is_finite()) || self.timing.min_interval_secs < 0.0 {
            anyhow::bail!("min_interval_secs must be a non-negative number");
        }

        Ok(())
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            rtt_base: Duration::from_millis(self.timing.rtt_base_ms),
            backoff_cap: Duration::from_millis(self.timing.backoff_cap_ms),
            handshake_retries: self.timing.handshake_retries,
            per_chunk_retries: self.timing.per_chunk_retries,
            window: self.timing.window,
            min_interval: Duration::from_secs_f64(self.timing.min_interval_secs),
            idle_timeout: Duration::from_secs(self.timing.idle_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.net.port, 123);
        assert_eq!(config.timing.rtt_base_ms, 500);
        assert_eq!(config.timing.window, 32);
        assert_eq!(config.timing.idle_timeout_secs, 60);
        assert!(config.server.storage_root.is_none());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();

        // Magic non configuré
        assert!(config.validate().is_err());

        config.net.magic = 0xDEAD_BEEF;
        assert!(config.validate().is_ok());

        config.timing.window = 0;
        assert!(config.validate().is_err());

        config.timing.window = 32;
        config.timing.min_interval_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [net]
            magic = 3735928559
            port = 1230

            [timing]
            min_interval_secs = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.net.magic, 0xDEAD_BEEF);
        assert_eq!(config.net.port, 1230);
        assert_eq!(config.timing.min_interval_secs, 0.25);
        // Le reste garde ses défauts
        assert_eq!(config.timing.window, 32);
    }

    #[test]
    fn test_partial_server_table() {
        // Une table [server] sans storage_root : le fichier fournit les
        // autres champs, la CLI fournira la racine (-s)
        let config: Config = toml::from_str(
            r#"
            [net]
            magic = 1

            [server]
            overwrite = true
            "#,
        )
        .unwrap();

        assert!(config.server.overwrite);
        assert_eq!(config.server.storage_root, None);
        assert_eq!(config.server.bind_address, "0.0.0.0");
    }
}
