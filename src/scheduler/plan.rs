use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::cron::CronExpr;
use crate::error::{CronError, Result};
use crate::scheduler::job::Job;

/// Schedule state for one known job.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub job: Job,
    pub expr: CronExpr,
    pub next_fire: DateTime<Utc>,
}

impl SchedulePlan {
    /// Parse the job's schedule and compute its first fire time after `now`.
    pub fn build(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let expr = CronExpr::parse(&job.cron_expr)?;
        let next_fire = expr.next_after(now).ok_or_else(|| {
            CronError::InvalidJob(format!(
                "schedule '{}' has no future occurrence",
                job.cron_expr
            ))
        })?;
        Ok(Self {
            job,
            expr,
            next_fire,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire <= now
    }

    /// Move `next_fire` to the first occurrence after `now`. Never moves it
    /// backwards. Returns false when the schedule has no further occurrence.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match self.expr.next_after(now) {
            Some(next) => {
                self.next_fire = self.next_fire.max(next);
                true
            }
            None => false,
        }
    }
}

/// Job name → schedule plan. Owned and mutated by the dispatcher only.
#[derive(Debug, Default)]
pub struct SchedulePlanTable {
    plans: HashMap<String, SchedulePlan>,
}

impl SchedulePlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the plan for a job. Returns the replaced plan.
    pub fn upsert(&mut self, plan: SchedulePlan) -> Option<SchedulePlan> {
        self.plans.insert(plan.job.name.clone(), plan)
    }

    pub fn remove(&mut self, name: &str) -> Option<SchedulePlan> {
        self.plans.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&SchedulePlan> {
        self.plans.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SchedulePlan> {
        self.plans.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plans.contains_key(name)
    }

    /// Names of every planned job, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the jobs whose next fire time is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .plans
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| p.job.name.clone())
            .collect();
        due.sort();
        due
    }

    /// Soonest next fire time across all plans.
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.plans.values().map(|p| p.next_fire).min()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
