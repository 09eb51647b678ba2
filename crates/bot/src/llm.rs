use anyhow::{Context, Result};
use common::calendar::now_kst;
use common::config::Llm;
use common::types::{GameError, OpError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// The text oracle itself is an external collaborator; the core only knows
/// how to ask and how much the answer cost. Wired up by whichever transport
/// integration links an actual model client.
#[allow(dead_code)]
pub trait TextOracle {
    fn generate(
        &self,
        instructions: &str,
        input: &str,
        max_tokens: u32,
    ) -> impl std::future::Future<Output = Result<OracleReply>> + Send;
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleReply {
    pub text: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// One month of spend, persisted as a small JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthUsage {
    pub month: String,
    pub total_usd: f64,
    pub total_tokens: i64,
    pub total_calls: i64,
}

impl MonthUsage {
    fn fresh(month: String) -> Self {
        Self {
            month,
            total_usd: 0.0,
            total_tokens: 0,
            total_calls: 0,
        }
    }
}

fn current_month() -> String {
    now_kst().format("%Y-%m").to_string()
}

/// Monthly USD hard cap for oracle calls. The ledger refuses a call when the
/// estimated cost would cross the limit; actual usage is recorded after each
/// successful call and survives restarts.
pub struct LlmBudget {
    path: PathBuf,
    config: Llm,
    usage: Mutex<MonthUsage>,
}

impl LlmBudget {
    pub fn load(path: PathBuf, config: Llm) -> Self {
        let month = current_month();
        let usage = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<MonthUsage>(&text).ok())
            .filter(|u| u.month == month)
            .unwrap_or_else(|| MonthUsage::fresh(month));
        Self {
            path,
            config,
            usage: Mutex::new(usage),
        }
    }

    #[allow(dead_code)]
    fn cost_usd(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.config.price_input_per_1k
            + (completion_tokens as f64 / 1000.0) * self.config.price_output_per_1k
    }

    /// Worst-case estimate before the call: the whole input billed as prompt
    /// tokens (~4 chars/token) plus the full completion budget.
    #[allow(dead_code)]
    fn estimate_usd(&self, input_chars: usize, max_tokens: u32) -> f64 {
        self.cost_usd((input_chars as i64) / 4 + 1, i64::from(max_tokens))
    }

    pub fn summary(&self) -> MonthUsage {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    pub fn remaining_usd(&self) -> f64 {
        (self.config.hard_limit_usd - self.summary().total_usd).max(0.0)
    }

    fn roll_month(&self, usage: &mut MonthUsage) {
        let month = current_month();
        if usage.month != month {
            *usage = MonthUsage::fresh(month);
        }
    }

    #[allow(dead_code)]
    fn record(&self, prompt_tokens: i64, completion_tokens: i64) {
        let cost = self.cost_usd(prompt_tokens, completion_tokens);
        let snapshot = {
            let mut usage = self.usage.lock().expect("usage lock poisoned");
            self.roll_month(&mut usage);
            usage.total_usd += cost;
            usage.total_tokens += prompt_tokens + completion_tokens;
            usage.total_calls += 1;
            usage.clone()
        };
        if let Err(e) = self.save(&snapshot) {
            tracing::warn!(error = %e, "llm usage save failed");
        }
    }

    fn save(&self, usage: &MonthUsage) -> Result<()> {
        let dir = self.path.parent().context("usage path has no parent")?;
        std::fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), serde_json::to_vec_pretty(usage)?)?;
        tmp.persist(&self.path).context("persist llm usage")?;
        Ok(())
    }

    /// Budget-gated generation. `BudgetExceeded` is a typed refusal the
    /// caller turns into a fixed user-visible message.
    #[allow(dead_code)]
    pub async fn generate<O: TextOracle>(
        &self,
        oracle: &O,
        instructions: &str,
        input: &str,
        max_tokens: u32,
    ) -> std::result::Result<String, OpError> {
        let estimate = self.estimate_usd(instructions.len() + input.len(), max_tokens);
        {
            let mut usage = self.usage.lock().expect("usage lock poisoned");
            self.roll_month(&mut usage);
            if usage.total_usd + estimate > self.config.hard_limit_usd {
                return Err(GameError::BudgetExceeded.into());
            }
        }

        let reply = oracle
            .generate(instructions, input, max_tokens)
            .await
            .map_err(OpError::Store)?;
        self.record(reply.prompt_tokens, reply.completion_tokens);
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOracle {
        reply: OracleReply,
    }

    impl TextOracle for FixedOracle {
        async fn generate(&self, _: &str, _: &str, _: u32) -> Result<OracleReply> {
            Ok(self.reply.clone())
        }
    }

    fn config(limit: f64) -> Llm {
        Llm {
            api_key: "k".into(),
            model: "test-model".into(),
            hard_limit_usd: limit,
            price_input_per_1k: 0.001,
            price_output_per_1k: 0.002,
        }
    }

    fn temp_budget(limit: f64) -> (tempfile::TempDir, LlmBudget) {
        let dir = tempfile::tempdir().unwrap();
        let budget = LlmBudget::load(dir.path().join("llm_usage.json"), config(limit));
        (dir, budget)
    }

    #[tokio::test]
    async fn test_generate_records_usage() {
        let (_dir, budget) = temp_budget(10.0);
        let oracle = FixedOracle {
            reply: OracleReply {
                text: "hello".into(),
                prompt_tokens: 1_000,
                completion_tokens: 500,
            },
        };

        let text = budget.generate(&oracle, "sys", "hi", 64).await.unwrap();
        assert_eq!(text, "hello");

        let usage = budget.summary();
        assert_eq!(usage.total_calls, 1);
        assert_eq!(usage.total_tokens, 1_500);
        // 1.0k * 0.001 + 0.5k * 0.002 = 0.002.
        assert!((usage.total_usd - 0.002).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_refusal() {
        let (_dir, budget) = temp_budget(0.000_001);
        let oracle = FixedOracle {
            reply: OracleReply {
                text: "never".into(),
                prompt_tokens: 10,
                completion_tokens: 10,
            },
        };

        let err = budget.generate(&oracle, "sys", "hi", 4_096).await.unwrap_err();
        assert_eq!(err.as_game(), Some(&GameError::BudgetExceeded));
        assert_eq!(budget.summary().total_calls, 0);
    }

    #[tokio::test]
    async fn test_usage_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_usage.json");
        let budget = LlmBudget::load(path.clone(), config(10.0));
        let oracle = FixedOracle {
            reply: OracleReply {
                text: "x".into(),
                prompt_tokens: 2_000,
                completion_tokens: 0,
            },
        };
        budget.generate(&oracle, "", "", 1).await.unwrap();
        budget.generate(&oracle, "", "", 1).await.unwrap();

        let reloaded = LlmBudget::load(path, config(10.0));
        let usage = reloaded.summary();
        assert_eq!(usage.total_calls, 2);
        assert_eq!(usage.total_tokens, 4_000);
    }

    #[test]
    fn test_stale_month_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_usage.json");
        let stale = MonthUsage {
            month: "1999-01".into(),
            total_usd: 9.99,
            total_tokens: 1,
            total_calls: 1,
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let budget = LlmBudget::load(path, config(10.0));
        let usage = budget.summary();
        assert_eq!(usage.total_calls, 0);
        assert!(usage.total_usd.abs() < 1e-12);
    }
}
