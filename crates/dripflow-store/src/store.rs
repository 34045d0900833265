//! SQLite persistence for all scheduler data. One connection behind
//! a mutex; callers are the dispatcher and the campaign operations
//! layer, both low-frequency relative to SQLite's throughput.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::de::DeserializeOwned;

use dripflow_core::{
    AudienceFilter, Bot, Campaign, CampaignKind, CampaignStats, CampaignStatus, DripflowError,
    Flow, JobStatus, Lead, Result, RunStats, ScheduledMessage, SequenceProgress, StepRecord,
    Throttling,
};

/// Durable store over a single SQLite database.
pub struct Store {
    conn: Mutex<Connection>,
}

fn sql_err(e: rusqlite::Error) -> DripflowError {
    DripflowError::Store(e.to_string())
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn ts_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl Store {
    /// Open or create the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                filter TEXT NOT NULL,            -- JSON AudienceFilter
                throttling TEXT NOT NULL,        -- JSON Throttling
                status TEXT NOT NULL DEFAULT 'draft',
                kind TEXT NOT NULL,              -- JSON CampaignKind
                targeted INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                leads_entered INTEGER NOT NULL DEFAULT 0,
                messages_sent INTEGER NOT NULL DEFAULT 0,
                flows_completed INTEGER NOT NULL DEFAULT 0,
                last_run TEXT,
                next_run TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status
                ON campaigns(status, next_run);

            CREATE TABLE IF NOT EXISTS sequence_progress (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_step_index INTEGER NOT NULL DEFAULT -1,
                last_step_sent_at TEXT,
                next_step_scheduled_for TEXT,
                is_completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_progress_lead_campaign
                ON sequence_progress(lead_id, campaign_id);
            CREATE INDEX IF NOT EXISTS idx_progress_due
                ON sequence_progress(is_completed, next_step_scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_progress_campaign
                ON sequence_progress(campaign_id, is_completed);

            -- Append-only per-step audit log.
            CREATE TABLE IF NOT EXISTS sequence_step_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                progress_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                flow_id TEXT NOT NULL,
                scheduled_for TEXT,
                sent_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_step_log_progress
                ON sequence_step_log(progress_id);

            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                scheduled_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due
                ON scheduled_messages(status, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_jobs_campaign
                ON scheduled_messages(campaign_id, status);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',           -- JSON array
                custom_fields TEXT NOT NULL DEFAULT '{}',  -- JSON map
                is_active INTEGER NOT NULL DEFAULT 1,
                last_interaction TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_leads_bot_chat
                ON leads(bot_id, chat_id);
            CREATE INDEX IF NOT EXISTS idx_leads_bot_active
                ON leads(bot_id, is_active);

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parts TEXT NOT NULL          -- JSON array of MessagePart
            );

            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token TEXT NOT NULL,
                username TEXT NOT NULL DEFAULT ''
            );

            -- One row per broadcast run. finished_at stays NULL
            -- while the run's jobs are still in flight.
            CREATE TABLE IF NOT EXISTS campaign_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id TEXT NOT NULL,
                run_date TEXT NOT NULL,
                targeted INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                finished_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_campaign
                ON campaign_runs(campaign_id);

            -- Daily rollups for sequence campaigns.
            CREATE TABLE IF NOT EXISTS campaign_daily_stats (
                campaign_id TEXT NOT NULL,
                day TEXT NOT NULL,
                messages_sent INTEGER NOT NULL DEFAULT 0,
                new_leads INTEGER NOT NULL DEFAULT 0,
                completed_flows INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (campaign_id, day)
            );
         ",
            )
            .map_err(sql_err)?;
        Ok(())
    }

    // ─── Campaigns ──────────────────────────────────────

    pub fn save_campaign(&self, campaign: &Campaign) -> Result<()> {
        let filter = serde_json::to_string(&campaign.filter)
            .map_err(|e| DripflowError::Store(e.to_string()))?;
        let throttling = serde_json::to_string(&campaign.throttling)
            .map_err(|e| DripflowError::Store(e.to_string()))?;
        let kind = serde_json::to_string(&campaign.kind)
            .map_err(|e| DripflowError::Store(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO campaigns
                 (id, user_id, bot_id, name, description, filter, throttling, status, kind,
                  targeted, sent, succeeded, failed, blocked, leads_entered, messages_sent,
                  flows_completed, last_run, next_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    campaign.id,
                    campaign.user_id,
                    campaign.bot_id,
                    campaign.name,
                    campaign.description,
                    filter,
                    throttling,
                    campaign.status.as_str(),
                    kind,
                    campaign.stats.targeted,
                    campaign.stats.sent,
                    campaign.stats.succeeded,
                    campaign.stats.failed,
                    campaign.stats.blocked,
                    campaign.stats.leads_entered,
                    campaign.stats.messages_sent,
                    campaign.stats.flows_completed,
                    ts_opt(&campaign.stats.last_run),
                    ts_opt(&campaign.stats.next_run),
                    ts(&campaign.created_at),
                    ts(&campaign.updated_at),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn campaign_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
        let filter_raw: String = row.get(5)?;
        let throttling_raw: String = row.get(6)?;
        let status_raw: String = row.get(7)?;
        let kind_raw: String = row.get(8)?;
        let last_run: Option<String> = row.get(17)?;
        let next_run: Option<String> = row.get(18)?;
        let created_at: String = row.get(19)?;
        let updated_at: String = row.get(20)?;

        let filter: AudienceFilter = json_col(5, &filter_raw)?;
        let throttling: Throttling = json_col(6, &throttling_raw)?;
        let kind: CampaignKind = json_col(8, &kind_raw)?;

        Ok(Campaign {
            id: row.get(0)?,
            user_id: row.get(1)?,
            bot_id: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            filter,
            throttling,
            status: CampaignStatus::parse(&status_raw),
            kind,
            stats: CampaignStats {
                targeted: row.get(9)?,
                sent: row.get(10)?,
                succeeded: row.get(11)?,
                failed: row.get(12)?,
                blocked: row.get(13)?,
                leads_entered: row.get(14)?,
                messages_sent: row.get(15)?,
                flows_completed: row.get(16)?,
                last_run: parse_ts_opt(last_run),
                next_run: parse_ts_opt(next_run),
            },
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    const CAMPAIGN_COLS: &'static str = "id, user_id, bot_id, name, description, filter, \
        throttling, status, kind, targeted, sent, succeeded, failed, blocked, leads_entered, \
        messages_sent, flows_completed, last_run, next_run, created_at, updated_at";

    pub fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM campaigns WHERE id = ?1", Self::CAMPAIGN_COLS);
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let mut rows = stmt
            .query_map([id], Self::campaign_from_row)
            .map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    /// Broadcast campaigns whose next run is due.
    pub fn due_broadcasts(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Campaign>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM campaigns
             WHERE status = 'scheduled' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run LIMIT ?2",
            Self::CAMPAIGN_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![ts(&now), limit], Self::campaign_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Active sequence campaigns (kind is JSON-tagged).
    pub fn active_sequence_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM campaigns
             WHERE status IN ('scheduled', 'running')
               AND kind LIKE '{{\"type\":\"sequence\"%'",
            Self::CAMPAIGN_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([], Self::campaign_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Broadcast campaigns still marked running, the candidates for
    /// run finalization once their jobs drain.
    pub fn running_broadcasts(&self) -> Result<Vec<Campaign>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM campaigns
             WHERE status = 'running' AND kind LIKE '{{\"type\":\"broadcast\"%'",
            Self::CAMPAIGN_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([], Self::campaign_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Conditional status transition. Returns false (and changes
    /// nothing) when the current status is not `from`.
    pub fn transition_campaign(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), ts(&Utc::now()), id, from.as_str()],
            )
            .map_err(sql_err)?;
        Ok(changed == 1)
    }

    pub fn set_campaign_status(&self, id: &str, status: CampaignStatus) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET next_run = ?1 WHERE id = ?2",
                params![ts_opt(&next_run), id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Open a run-history row at trigger time; stamps `last_run` and
    /// the targeted counter. Finalized by `finish_run` once every
    /// job of the run is terminal.
    pub fn start_run(&self, id: &str, run_date: DateTime<Utc>, targeted: u64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "UPDATE campaigns SET targeted = targeted + ?1, last_run = ?2, updated_at = ?2
             WHERE id = ?3",
            params![targeted, ts(&run_date), id],
        )
        .map_err(sql_err)?;
        conn.execute(
            "INSERT INTO campaign_runs (campaign_id, run_date, targeted) VALUES (?1, ?2, ?3)",
            params![id, ts(&run_date), targeted],
        )
        .map_err(sql_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent unfinished run of a campaign, as
    /// (run_id, run_date, targeted).
    pub fn open_run(&self, id: &str) -> Result<Option<(i64, DateTime<Utc>, u64)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, run_date, targeted FROM campaign_runs
                 WHERE campaign_id = ?1 AND finished_at IS NULL
                 ORDER BY id DESC LIMIT 1",
            )
            .map_err(sql_err)?;
        let mut rows = stmt
            .query_map([id], |row| {
                let run_date: String = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, parse_ts(&run_date), row.get::<_, u64>(2)?))
            })
            .map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    /// Close a run: stamp its outcome counters and fold them into
    /// the campaign totals (targeted was added at `start_run`).
    pub fn finish_run(&self, run_id: i64, campaign_id: &str, stats: &RunStats) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE campaign_runs SET
                 sent = ?1, succeeded = ?2, failed = ?3, blocked = ?4, finished_at = ?5
             WHERE id = ?6",
            params![
                stats.sent,
                stats.succeeded,
                stats.failed,
                stats.blocked,
                ts(&Utc::now()),
                run_id
            ],
        )
        .map_err(sql_err)?;
        conn.execute(
            "UPDATE campaigns SET
                 sent = sent + ?1, succeeded = succeeded + ?2, failed = failed + ?3,
                 blocked = blocked + ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                stats.sent,
                stats.succeeded,
                stats.failed,
                stats.blocked,
                ts(&Utc::now()),
                campaign_id
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Record a run that failed before creating any jobs.
    pub fn record_run_error(&self, id: &str, error: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO campaign_runs (campaign_id, run_date, finished_at, error)
                 VALUES (?1, ?2, ?2, ?3)",
                params![id, ts(&Utc::now()), error],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_leads_entered(&self, id: &str, count: u64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET leads_entered = leads_entered + ?1 WHERE id = ?2",
                params![count, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_messages_sent(&self, id: &str, count: u64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET messages_sent = messages_sent + ?1 WHERE id = ?2",
                params![count, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_flows_completed(&self, id: &str, count: u64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET flows_completed = flows_completed + ?1 WHERE id = ?2",
                params![count, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Upsert one day's rollup counters for a campaign.
    pub fn bump_daily_stats(
        &self,
        id: &str,
        day: NaiveDate,
        messages_sent: u64,
        new_leads: u64,
        completed_flows: u64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO campaign_daily_stats
                     (campaign_id, day, messages_sent, new_leads, completed_flows)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(campaign_id, day) DO UPDATE SET
                     messages_sent = messages_sent + ?3,
                     new_leads = new_leads + ?4,
                     completed_flows = completed_flows + ?5",
                params![id, day.to_string(), messages_sent, new_leads, completed_flows],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Delete a campaign and everything hanging off it. Pending jobs
    /// are cancelled, not deleted, so their history survives.
    pub fn delete_campaign(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE scheduled_messages SET status = 'cancelled'
             WHERE campaign_id = ?1 AND status IN ('pending', 'processing')",
            [id],
        )
        .map_err(sql_err)?;
        conn.execute(
            "DELETE FROM sequence_step_log WHERE progress_id IN
                 (SELECT id FROM sequence_progress WHERE campaign_id = ?1)",
            [id],
        )
        .map_err(sql_err)?;
        conn.execute("DELETE FROM sequence_progress WHERE campaign_id = ?1", [id])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM campaign_daily_stats WHERE campaign_id = ?1", [id])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM campaigns WHERE id = ?1", [id])
            .map_err(sql_err)?;
        Ok(())
    }

    // ─── Sequence progress ──────────────────────────────────────

    const PROGRESS_COLS: &'static str = "id, lead_id, campaign_id, started_at, last_step_index, \
        last_step_sent_at, next_step_scheduled_for, is_completed, completed_at";

    fn progress_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceProgress> {
        let started_at: String = row.get(3)?;
        let last_step_sent_at: Option<String> = row.get(5)?;
        let next_step: Option<String> = row.get(6)?;
        let completed_at: Option<String> = row.get(8)?;
        Ok(SequenceProgress {
            id: row.get(0)?,
            lead_id: row.get(1)?,
            campaign_id: row.get(2)?,
            started_at: parse_ts(&started_at),
            last_step_index: row.get(4)?,
            last_step_sent_at: parse_ts_opt(last_step_sent_at),
            next_step_scheduled_for: parse_ts_opt(next_step),
            is_completed: row.get::<_, i64>(7)? != 0,
            completed_at: parse_ts_opt(completed_at),
        })
    }

    /// Insert a progress row unless one already exists for the
    /// (lead, campaign) pair. Returns true when inserted; this is
    /// what makes enrollment idempotent.
    pub fn insert_progress_if_absent(&self, progress: &SequenceProgress) -> Result<bool> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO sequence_progress
                 (id, lead_id, campaign_id, started_at, last_step_index, last_step_sent_at,
                  next_step_scheduled_for, is_completed, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    progress.id,
                    progress.lead_id,
                    progress.campaign_id,
                    ts(&progress.started_at),
                    progress.last_step_index,
                    ts_opt(&progress.last_step_sent_at),
                    ts_opt(&progress.next_step_scheduled_for),
                    progress.is_completed as i64,
                    ts_opt(&progress.completed_at),
                ],
            )
            .map_err(sql_err)?;
        Ok(inserted == 1)
    }

    pub fn get_progress(&self, lead_id: &str, campaign_id: &str) -> Result<Option<SequenceProgress>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM sequence_progress WHERE lead_id = ?1 AND campaign_id = ?2",
            Self::PROGRESS_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let mut rows = stmt
            .query_map(params![lead_id, campaign_id], Self::progress_from_row)
            .map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    /// Progress rows whose next step is due.
    pub fn due_progress(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SequenceProgress>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM sequence_progress
             WHERE is_completed = 0 AND next_step_scheduled_for IS NOT NULL
               AND next_step_scheduled_for <= ?1
             ORDER BY next_step_scheduled_for LIMIT ?2",
            Self::PROGRESS_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![ts(&now), limit], Self::progress_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn update_progress(&self, progress: &SequenceProgress) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE sequence_progress SET
                     last_step_index = ?1, last_step_sent_at = ?2,
                     next_step_scheduled_for = ?3, is_completed = ?4, completed_at = ?5
                 WHERE id = ?6",
                params![
                    progress.last_step_index,
                    ts_opt(&progress.last_step_sent_at),
                    ts_opt(&progress.next_step_scheduled_for),
                    progress.is_completed as i64,
                    ts_opt(&progress.completed_at),
                    progress.id,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn append_step_record(&self, progress_id: &str, record: &StepRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sequence_step_log
                     (progress_id, step_index, flow_id, scheduled_for, sent_at, success, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    progress_id,
                    record.step_index,
                    record.flow_id,
                    ts_opt(&record.scheduled_for),
                    ts(&record.sent_at),
                    record.success as i64,
                    record.error,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn step_records(&self, progress_id: &str) -> Result<Vec<StepRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT step_index, flow_id, scheduled_for, sent_at, success, error
                 FROM sequence_step_log WHERE progress_id = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([progress_id], |row| {
                let scheduled_for: Option<String> = row.get(2)?;
                let sent_at: String = row.get(3)?;
                Ok(StepRecord {
                    step_index: row.get(0)?,
                    flow_id: row.get(1)?,
                    scheduled_for: parse_ts_opt(scheduled_for),
                    sent_at: parse_ts(&sent_at),
                    success: row.get::<_, i64>(4)? != 0,
                    error: row.get(5)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn delete_progress(&self, lead_id: &str, campaign_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM sequence_step_log WHERE progress_id IN
                 (SELECT id FROM sequence_progress WHERE lead_id = ?1 AND campaign_id = ?2)",
            params![lead_id, campaign_id],
        )
        .map_err(sql_err)?;
        conn.execute(
            "DELETE FROM sequence_progress WHERE lead_id = ?1 AND campaign_id = ?2",
            params![lead_id, campaign_id],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Mark all still-active progress rows of a campaign completed.
    pub fn complete_all_progress(&self, campaign_id: &str) -> Result<u64> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sequence_progress SET is_completed = 1, completed_at = ?1
                 WHERE campaign_id = ?2 AND is_completed = 0",
                params![ts(&Utc::now()), campaign_id],
            )
            .map_err(sql_err)?;
        Ok(changed as u64)
    }

    /// (total, active, completed) progress counts for a campaign.
    pub fn progress_counts(&self, campaign_id: &str) -> Result<(u64, u64, u64)> {
        let conn = self.conn();
        let (total, completed): (u64, u64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(is_completed), 0)
                 FROM sequence_progress WHERE campaign_id = ?1",
                [campaign_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(sql_err)?;
        Ok((total, total - completed, completed))
    }

    /// Leads that finished a campaign's sequence.
    pub fn completed_lead_ids(&self, campaign_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT lead_id FROM sequence_progress
                 WHERE campaign_id = ?1 AND is_completed = 1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([campaign_id], |row| row.get(0))
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// How many leads currently sit at each step index.
    pub fn leads_per_step(&self, campaign_id: &str) -> Result<Vec<(i32, u64)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT last_step_index, COUNT(*) FROM sequence_progress
                 WHERE campaign_id = ?1 GROUP BY last_step_index ORDER BY last_step_index",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([campaign_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    // ─── One-shot jobs ──────────────────────────────────────

    const JOB_COLS: &'static str = "id, user_id, bot_id, lead_id, flow_id, campaign_id, \
        scheduled_time, status, sent_at, error, attempts, created_at";

    fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledMessage> {
        let scheduled_time: String = row.get(6)?;
        let status: String = row.get(7)?;
        let sent_at: Option<String> = row.get(8)?;
        let created_at: String = row.get(11)?;
        Ok(ScheduledMessage {
            id: row.get(0)?,
            user_id: row.get(1)?,
            bot_id: row.get(2)?,
            lead_id: row.get(3)?,
            flow_id: row.get(4)?,
            campaign_id: row.get(5)?,
            scheduled_time: parse_ts(&scheduled_time),
            status: JobStatus::parse(&status),
            sent_at: parse_ts_opt(sent_at),
            error: row.get(9)?,
            attempts: row.get(10)?,
            created_at: parse_ts(&created_at),
        })
    }

    pub fn insert_job(&self, job: &ScheduledMessage) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO scheduled_messages
                 (id, user_id, bot_id, lead_id, flow_id, campaign_id, scheduled_time, status,
                  sent_at, error, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id,
                    job.user_id,
                    job.bot_id,
                    job.lead_id,
                    job.flow_id,
                    job.campaign_id,
                    ts(&job.scheduled_time),
                    job.status.as_str(),
                    ts_opt(&job.sent_at),
                    job.error,
                    job.attempts,
                    ts(&job.created_at),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Bulk insert inside one transaction. Broadcast triggering
    /// creates jobs for whole audiences at once.
    pub fn insert_jobs(&self, jobs: &[ScheduledMessage]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(sql_err)?;
        for job in jobs {
            tx.execute(
                "INSERT INTO scheduled_messages
                 (id, user_id, bot_id, lead_id, flow_id, campaign_id, scheduled_time, status,
                  sent_at, error, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id,
                    job.user_id,
                    job.bot_id,
                    job.lead_id,
                    job.flow_id,
                    job.campaign_id,
                    ts(&job.scheduled_time),
                    job.status.as_str(),
                    ts_opt(&job.sent_at),
                    job.error,
                    job.attempts,
                    ts(&job.created_at),
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM scheduled_messages WHERE id = ?1",
            Self::JOB_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let mut rows = stmt.query_map([id], Self::job_from_row).map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    pub fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledMessage>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM scheduled_messages
             WHERE status = 'pending' AND scheduled_time <= ?1
             ORDER BY scheduled_time LIMIT ?2",
            Self::JOB_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![ts(&now), limit], Self::job_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Conditional job status transition (CAS on the status column).
    pub fn transition_job(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .map_err(sql_err)?;
        Ok(changed == 1)
    }

    pub fn mark_job_sent(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scheduled_messages SET status = 'sent', sent_at = ?1 WHERE id = ?2",
                params![ts(&at), id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn mark_job_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scheduled_messages SET status = 'failed', error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn mark_job_cancelled(&self, id: &str, reason: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scheduled_messages SET status = 'cancelled', error = ?1 WHERE id = ?2",
                params![reason, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Push a rate-limited job back to pending at a later time.
    pub fn reschedule_job(&self, id: &str, at: DateTime<Utc>, attempts: u32) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scheduled_messages
                 SET status = 'pending', scheduled_time = ?1, attempts = ?2 WHERE id = ?3",
                params![ts(&at), attempts, id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Cancel every pending job of a campaign. Returns how many.
    pub fn cancel_pending_jobs(&self, campaign_id: &str) -> Result<u64> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET status = 'cancelled'
                 WHERE campaign_id = ?1 AND status = 'pending'",
                [campaign_id],
            )
            .map_err(sql_err)?;
        Ok(changed as u64)
    }

    /// Jobs of a campaign not yet terminal.
    pub fn open_job_count(&self, campaign_id: &str) -> Result<u64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM scheduled_messages
             WHERE campaign_id = ?1 AND status IN ('pending', 'processing')",
            [campaign_id],
            |row| row.get(0),
        )
        .map_err(sql_err)
    }

    /// Terminal job outcomes for one run, scoped by creation time.
    /// Blocked deliveries are the failed jobs whose recipient was
    /// permanently unreachable.
    pub fn job_outcomes_since(&self, campaign_id: &str, since: DateTime<Utc>) -> Result<RunStats> {
        let conn = self.conn();
        let (succeeded, failed, blocked): (u64, u64, u64) = conn
            .query_row(
                "SELECT
                     COALESCE(SUM(status = 'sent'), 0),
                     COALESCE(SUM(status = 'failed'), 0),
                     COALESCE(SUM(status = 'failed'
                         AND error LIKE 'recipient unreachable%'), 0)
                 FROM scheduled_messages
                 WHERE campaign_id = ?1 AND created_at >= ?2",
                params![campaign_id, ts(&since)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(sql_err)?;
        Ok(RunStats {
            targeted: 0,
            sent: succeeded + failed,
            succeeded,
            failed,
            blocked,
        })
    }

    // ─── Leads ──────────────────────────────────────

    const LEAD_COLS: &'static str = "id, user_id, bot_id, chat_id, first_name, last_name, \
        username, tags, custom_fields, is_active, last_interaction, created_at";

    fn lead_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
        let tags_raw: String = row.get(7)?;
        let fields_raw: String = row.get(8)?;
        let last_interaction: String = row.get(10)?;
        let created_at: String = row.get(11)?;
        Ok(Lead {
            id: row.get(0)?,
            user_id: row.get(1)?,
            bot_id: row.get(2)?,
            chat_id: row.get(3)?,
            first_name: row.get(4)?,
            last_name: row.get(5)?,
            username: row.get(6)?,
            tags: json_col(7, &tags_raw)?,
            custom_fields: json_col(8, &fields_raw)?,
            is_active: row.get::<_, i64>(9)? != 0,
            last_interaction: parse_ts(&last_interaction),
            created_at: parse_ts(&created_at),
        })
    }

    pub fn save_lead(&self, lead: &Lead) -> Result<()> {
        let tags =
            serde_json::to_string(&lead.tags).map_err(|e| DripflowError::Store(e.to_string()))?;
        let fields = serde_json::to_string(&lead.custom_fields)
            .map_err(|e| DripflowError::Store(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO leads
                 (id, user_id, bot_id, chat_id, first_name, last_name, username, tags,
                  custom_fields, is_active, last_interaction, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    lead.id,
                    lead.user_id,
                    lead.bot_id,
                    lead.chat_id,
                    lead.first_name,
                    lead.last_name,
                    lead.username,
                    tags,
                    fields,
                    lead.is_active as i64,
                    ts(&lead.last_interaction),
                    ts(&lead.created_at),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM leads WHERE id = ?1", Self::LEAD_COLS);
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let mut rows = stmt.query_map([id], Self::lead_from_row).map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    /// Active leads of one bot. Tag/field matching happens in the
    /// engine, recency and enrollment exclusion here.
    pub fn active_leads(&self, bot_id: &str) -> Result<Vec<Lead>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM leads WHERE bot_id = ?1 AND is_active = 1",
            Self::LEAD_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([bot_id], Self::lead_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Active leads of one bot with no progress row in the given
    /// campaign, the enrollment sweep candidates.
    pub fn active_leads_not_enrolled(&self, bot_id: &str, campaign_id: &str) -> Result<Vec<Lead>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM leads
             WHERE bot_id = ?1 AND is_active = 1
               AND id NOT IN (SELECT lead_id FROM sequence_progress WHERE campaign_id = ?2)",
            Self::LEAD_COLS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![bot_id, campaign_id], Self::lead_from_row)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn mark_lead_inactive(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("UPDATE leads SET is_active = 0 WHERE id = ?1", [id])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn touch_lead_interaction(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE leads SET last_interaction = ?1 WHERE id = ?2",
                params![ts(&at), id],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    // ─── Flows & bots ──────────────────────────────────────

    pub fn save_flow(&self, flow: &Flow) -> Result<()> {
        let parts =
            serde_json::to_string(&flow.parts).map_err(|e| DripflowError::Store(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO flows (id, name, parts) VALUES (?1, ?2, ?3)",
                params![flow.id, flow.name, parts],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, parts FROM flows WHERE id = ?1")
            .map_err(sql_err)?;
        let mut rows = stmt
            .query_map([id], |row| {
                let parts_raw: String = row.get(2)?;
                Ok(Flow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parts: json_col(2, &parts_raw)?,
                })
            })
            .map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }

    pub fn save_bot(&self, bot: &Bot) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO bots (id, user_id, token, username)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bot.id, bot.user_id, bot.token, bot.username],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_bot(&self, id: &str) -> Result<Option<Bot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, user_id, token, username FROM bots WHERE id = ?1")
            .map_err(sql_err)?;
        let mut rows = stmt
            .query_map([id], |row| {
                Ok(Bot {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    token: row.get(2)?,
                    username: row.get(3)?,
                })
            })
            .map_err(sql_err)?;
        rows.next().transpose().map_err(sql_err)
    }
}
