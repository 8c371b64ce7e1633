//! Row counts of the overview views, as printed by `pilot summary`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::app::context::Context;
use crate::error::Result;
use crate::impls::views::{JOB_OVERVIEW, TASK_OVERVIEW};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overview {
    pub tasks: BTreeMap<String, usize>,
    pub jobs: BTreeMap<String, usize>,
}

impl Overview {
    pub async fn collect(ctx: &Context) -> Result<Self> {
        Ok(Self::from_totals(ctx.tasks().overview_total().await?))
    }

    /// Split `overview_total()` output into its task and job halves.
    pub fn from_totals(mut totals: BTreeMap<String, usize>) -> Self {
        let mut take = |views: &[&str]| -> BTreeMap<String, usize> {
            views
                .iter()
                .map(|view| (view.to_string(), totals.remove(*view).unwrap_or(0)))
                .collect()
        };
        let tasks = take(&TASK_OVERVIEW);
        let jobs = take(&JOB_OVERVIEW);
        Self { tasks, jobs }
    }

    pub fn task_total(&self) -> usize {
        self.tasks.values().sum()
    }
}

impl fmt::Display for Overview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tasks:")?;
        for view in TASK_OVERVIEW {
            writeln!(f, "  {view:<14} {:>8}", self.tasks.get(view).copied().unwrap_or(0))?;
        }
        writeln!(f, "jobs:")?;
        for view in JOB_OVERVIEW {
            writeln!(f, "  {view:<14} {:>8}", self.jobs.get(view).copied().unwrap_or(0))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::app::context::ContextBuilder;
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;
    use serde_json::{Map, json};

    #[tokio::test]
    async fn counts_tasks_per_view() {
        let ctx = ContextBuilder::new()
            .task_db(Arc::new(InMemoryStore::default()))
            .clock(Arc::new(FixedClock::at(100)))
            .build()
            .unwrap();
        ctx.tasks().add(Map::new()).await.unwrap();
        let done = json!({"lock": 50, "done": 60});
        ctx.tasks().add(done.as_object().cloned().unwrap()).await.unwrap();

        let overview = Overview::collect(&ctx).await.unwrap();

        assert_eq!(overview.tasks["pending"], 1);
        assert_eq!(overview.tasks["done"], 1);
        assert_eq!(overview.tasks["in_progress"], 0);
        assert_eq!(overview.jobs["running_jobs"], 0);
        assert_eq!(overview.task_total(), 2);
    }

    #[test]
    fn display_lists_every_view() {
        let overview = Overview::from_totals(BTreeMap::from([("pending".to_string(), 3)]));
        let text = overview.to_string();
        assert!(text.contains("pending"));
        assert!(text.contains("archived_jobs"));
        assert!(text.lines().any(|l| l.trim_start().starts_with("pending") && l.ends_with('3')));
    }
}
