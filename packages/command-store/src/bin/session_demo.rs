//! Session Demo
//!
//! Wires a small IDE-session model through the coordinator: a durable
//! profile selection persisted to JSON, a model catalog refreshed by an
//! async operation, and a runtime probe of available integrations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use command_store::{
    operation, Command, CommandType, Coordinator, CoordinatorConfig, DurableState,
    JsonFileRepository, Rule, RuleRegistry, RuleResult, RuleSet, StateModel, Store, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// Model
// =============================================================================

/// Survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Settings {
    profile: Option<String>,
    #[serde(default)]
    recent_profiles: Vec<String>,
}

impl DurableState for Settings {
    const SCHEMA_VERSION: u32 = 2;

    fn migrate(version: u32, data: serde_json::Value) -> Result<Self, StoreError> {
        match version {
            // v1 had no recent list
            1 => serde_json::from_value(data).map_err(StoreError::Decode),
            found => Err(StoreError::UnsupportedVersion {
                found,
                expected: Self::SCHEMA_VERSION,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ModelCatalog {
    models: Vec<String>,
    fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Integration {
    name: &'static str,
    available: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Environment {
    integrations: Vec<Integration>,
    refreshing: bool,
    last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum SessionCommand {
    SelectProfile { name: String },
    RefreshCatalog,
    CatalogLoaded { models: Vec<String> },
    CatalogLoadFailed { reason: String },
    ProbeIntegrations,
    IntegrationsDetected { integrations: Vec<Integration> },
}

impl Command for SessionCommand {
    fn command_type(&self) -> CommandType {
        match self {
            SessionCommand::SelectProfile { .. } => CommandType::new("profile/SELECT"),
            SessionCommand::RefreshCatalog => CommandType::new("catalog/REFRESH"),
            SessionCommand::CatalogLoaded { .. } => CommandType::new("catalog/LOADED"),
            SessionCommand::CatalogLoadFailed { .. } => CommandType::new("catalog/LOAD_FAILED"),
            SessionCommand::ProbeIntegrations => CommandType::new("environment/PROBE"),
            SessionCommand::IntegrationsDetected { .. } => CommandType::new("environment/DETECTED"),
        }
    }
}

struct Session;

impl StateModel for Session {
    type Durable = Settings;
    type Catalog = ModelCatalog;
    type Runtime = Environment;
    type Command = SessionCommand;
}

// =============================================================================
// Rules
// =============================================================================

struct ProfileRules;

impl RuleSet<Session> for ProfileRules {
    fn register(self, registry: &RuleRegistry<Session>) {
        registry.register(
            Rule::<Session>::on("profile/SELECT")
                .named("select-profile")
                .when(|state, cmd| match cmd {
                    SessionCommand::SelectProfile { name } => {
                        state.durable().profile.as_ref() != Some(name)
                    }
                    _ => false,
                })
                .apply(|_, cmd| {
                    let SessionCommand::SelectProfile { name } = cmd else {
                        return Ok(RuleResult::<Session>::none());
                    };
                    anyhow::ensure!(!name.trim().is_empty(), "profile name is empty");

                    let name = name.clone();
                    Ok(RuleResult::<Session>::none()
                        .durable(move |settings| {
                            let mut recent: Vec<String> = settings
                                .recent_profiles
                                .iter()
                                .filter(|p| **p != name)
                                .cloned()
                                .collect();
                            recent.insert(0, name.clone());
                            recent.truncate(5);
                            Settings {
                                profile: Some(name),
                                recent_profiles: recent,
                            }
                        })
                        // A new profile may expose different models.
                        .follow_up(SessionCommand::RefreshCatalog))
                }),
        );
    }
}

struct CatalogRules {
    latency: Duration,
}

impl RuleSet<Session> for CatalogRules {
    fn register(self, registry: &RuleRegistry<Session>) {
        let latency = self.latency;

        registry.register(
            Rule::<Session>::on("catalog/REFRESH")
                .named("refresh-catalog")
                .when(|state, _| !state.runtime().refreshing)
                .apply(move |state, _| {
                    let profile = state.durable().profile.clone();
                    Ok(RuleResult::<Session>::none()
                        .runtime(|env| Environment {
                            refreshing: true,
                            ..env.clone()
                        })
                        .spawn(operation("catalog.fetch", move |ctx| async move {
                            tokio::select! {
                                _ = ctx.cancelled() => anyhow::bail!("catalog fetch cancelled"),
                                _ = tokio::time::sleep(latency) => {}
                            }
                            Ok(match profile {
                                Some(profile) => SessionCommand::CatalogLoaded {
                                    models: vec![
                                        format!("{profile}/fast"),
                                        format!("{profile}/large"),
                                    ],
                                },
                                None => SessionCommand::CatalogLoadFailed {
                                    reason: "no profile selected".into(),
                                },
                            })
                        })))
                }),
        );

        registry.register(
            Rule::<Session>::on("catalog/LOADED")
                .named("store-catalog")
                .apply(|_, cmd| {
                    let SessionCommand::CatalogLoaded { models } = cmd else {
                        return Ok(RuleResult::<Session>::none());
                    };
                    let models = models.clone();
                    Ok(RuleResult::<Session>::none()
                        .catalog(move |_| ModelCatalog {
                            models,
                            fetched_at: Some(Utc::now()),
                        })
                        .runtime(|env| Environment {
                            refreshing: false,
                            last_error: None,
                            ..env.clone()
                        }))
                }),
        );

        registry.register(
            Rule::<Session>::on("catalog/LOAD_FAILED")
                .named("record-catalog-failure")
                .apply(|_, cmd| {
                    let SessionCommand::CatalogLoadFailed { reason } = cmd else {
                        return Ok(RuleResult::<Session>::none());
                    };
                    let reason = reason.clone();
                    Ok(RuleResult::<Session>::none().runtime(move |env| Environment {
                        refreshing: false,
                        last_error: Some(reason),
                        ..env.clone()
                    }))
                }),
        );
    }
}

struct EnvironmentRules;

impl RuleSet<Session> for EnvironmentRules {
    fn register(self, registry: &RuleRegistry<Session>) {
        registry.register(
            Rule::<Session>::on("environment/PROBE")
                .named("probe-integrations")
                .apply(|_, _| {
                    let probe = operation("environment.probe", |_ctx| async {
                        let keys = [
                            ("openai", "OPENAI_API_KEY"),
                            ("anthropic", "ANTHROPIC_API_KEY"),
                        ];
                        let integrations = keys
                            .into_iter()
                            .map(|(name, key)| Integration {
                                name,
                                available: std::env::var(key).is_ok_and(|v| !v.is_empty()),
                            })
                            .collect();
                        Ok(SessionCommand::IntegrationsDetected { integrations })
                    });
                    Ok(RuleResult::<Session>::none().spawn(probe))
                }),
        );

        registry.register(
            Rule::<Session>::on("environment/DETECTED")
                .named("store-integrations")
                .apply(|_, cmd| {
                    let SessionCommand::IntegrationsDetected { integrations } = cmd else {
                        return Ok(RuleResult::<Session>::none());
                    };
                    let integrations = integrations.clone();
                    Ok(RuleResult::<Session>::none().runtime(move |env| Environment {
                        integrations,
                        ..env.clone()
                    }))
                }),
        );
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,command_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = CoordinatorConfig::from_env().context("Failed to load coordinator config")?;
    let state_path = PathBuf::from(
        std::env::var("SESSION_DEMO_STATE_PATH")
            .unwrap_or_else(|_| "session-state.json".to_string()),
    );
    tracing::info!(path = %state_path.display(), ?config, "Starting session demo");

    let store = Store::<Session>::new(
        Settings::default(),
        ModelCatalog::default(),
        Environment::default(),
    )
    .with_durable_repository(Arc::new(JsonFileRepository::new(&state_path)));
    if store.restore().await.context("Failed to restore session state")? {
        tracing::info!(settings = ?store.get_state().durable(), "Restored previous session");
    }

    let registry = Arc::new(RuleRegistry::new());
    registry.install(ProfileRules);
    registry.install(CatalogRules {
        latency: Duration::from_millis(150),
    });
    registry.install(EnvironmentRules);
    tracing::info!(rules = registry.len(), "Rules installed");

    let settle_timeout = config.settle_timeout;
    let coordinator = Coordinator::new(registry, store, config);

    let _snapshots = coordinator.subscribe(|snapshot| {
        tracing::info!(
            profile = ?snapshot.durable().profile,
            models = ?snapshot.catalog().models,
            integrations = snapshot.runtime().integrations.len(),
            last_error = ?snapshot.runtime().last_error,
            "Snapshot"
        );
    });
    let _meta = coordinator.subscribe_to_meta(|loading| tracing::info!(loading, "Work in flight"));

    let next_profile = match coordinator.state().durable().profile.as_deref() {
        Some("work") => "personal",
        _ => "work",
    };

    for command in [
        SessionCommand::ProbeIntegrations,
        SessionCommand::SelectProfile {
            name: next_profile.to_string(),
        },
        SessionCommand::RefreshCatalog,
    ] {
        let report = coordinator.dispatch(command).await?;
        tracing::info!(
            matched = report.matched,
            operations = report.operations,
            follow_ups = report.follow_ups,
            failed = report.failed.len(),
            emitted = report.emitted,
            "Dispatched"
        );
    }

    coordinator
        .wait_until_settled_timeout(settle_timeout)
        .await
        .context("Session did not settle")?;

    let state = coordinator.state();
    tracing::info!(
        profile = ?state.durable().profile,
        recent = ?state.durable().recent_profiles,
        models = ?state.catalog().models,
        revision = ?coordinator.store().durable_revision(),
        "Settled"
    );

    coordinator.dispose();
    Ok(())
}
