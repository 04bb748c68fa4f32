// src/engine.rs
//
// =============================================================================
// VOXLOGICA: SESSION (v 2.0)
// =============================================================================
//
// The wiring center: store + registry + prelude + parse + reduce + execute
// + goals. The CLI and the HTTP front end both drive the engine through
// this type.

use crate::core::EngineError;
use crate::dsl;
use crate::goals::{self, GoalOutcome};
use crate::primitives::Registry;
use crate::reducer::{self, Environment};
use crate::scheduler::{self, ExecutionReport};
use crate::store::{ResultStore, StoreStats};
use crate::workplan::WorkPlan;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

// ============================================================================
// 1. CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding the result store file.
    pub store_dir: PathBuf,
    /// Worker pool size. Defaults to hardware concurrency.
    pub workers: usize,
    /// Soft cap (entry count) on the in-memory non-serializable cache.
    pub memory_cap: usize,
    /// Forget recorded failures on open, so they re-run.
    pub clear_failed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("."),
            workers: num_cpus::get(),
            memory_cap: 256,
            clear_failed: false,
        }
    }
}

impl SessionConfig {
    pub fn store_path(&self) -> PathBuf {
        self.store_dir.join("voxlogica.db")
    }
}

// ============================================================================
// 2. THE SESSION
// ============================================================================

pub struct RunReport {
    pub plan: WorkPlan,
    pub exec: ExecutionReport,
    pub goals: Vec<GoalOutcome>,
}

impl RunReport {
    /// True when every node executed and every goal materialized.
    pub fn ok(&self) -> bool {
        self.exec.ok() && self.goals.iter().all(|g| g.result.is_ok())
    }
}

pub struct Session {
    store: Arc<ResultStore>,
    registry: Arc<Registry>,
    config: SessionConfig,
}

impl Session {
    pub fn open(config: SessionConfig) -> Result<Self, EngineError> {
        let store = ResultStore::open_with_cap(config.store_path(), config.memory_cap)?;
        if config.clear_failed {
            let cleared = store.clear_failed()?;
            if cleared > 0 {
                log::info!("cleared {} failed record(s)", cleared);
            }
        }
        Ok(Self {
            store: Arc::new(store),
            registry: Arc::new(Registry::new()),
            config,
        })
    }

    /// For callers that need extra namespaces (tests, embedders): the
    /// registry accepts providers until the first import.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        self.store.stats()
    }

    /// Parses and reduces the prelude plus a user program into a WorkPlan,
    /// without executing anything. Reduction errors discard the partial
    /// plan.
    pub fn reduce_source(&self, source: &str) -> Result<WorkPlan, EngineError> {
        let plan = WorkPlan::new(self.registry.clone());
        let prelude = dsl::parse_source(dsl::PRELUDE)?;
        let env = reducer::reduce_commands(&prelude.commands, Environment::new(), &plan)?;
        let program = dsl::parse_source(source)?;
        reducer::reduce_commands(&program.commands, env, &plan)?;
        Ok(plan)
    }

    /// Full pipeline: reduce, execute, run goals.
    pub async fn run_source(
        &self,
        source: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunReport, EngineError> {
        let plan = self.reduce_source(source)?;
        log::info!(
            "workplan ready: {} nodes, {} goals",
            plan.node_count(),
            plan.goals().len()
        );

        let (mut exec, ctx) = scheduler::execute(
            &plan,
            self.store.clone(),
            self.registry.clone(),
            self.config.workers,
            cancel,
        )
        .await?;

        if exec.cancelled {
            return Err(EngineError::Cancelled);
        }

        let goal_list = plan.goals();
        let goals = goals::run_goals(&ctx, &goal_list, &exec.failures).await;

        // Goal materialization streams dataset elements, which invokes
        // primitives too; fold that work into the final counters.
        exec.computed = ctx.computed_count();
        exec.cache_hits = ctx.cache_hit_count();

        Ok(RunReport { plan, exec, goals })
    }
}
