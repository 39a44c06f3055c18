use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_common::{Error, Result, Version};
use tracing::{error, info, warn};

use crate::ledger::{Ledger, LedgerEntry};
use crate::migrations::{Migration, SchemaChange};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// How far `revert` goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertTarget {
    /// Revert the `n` most recently versioned applied units.
    Count(usize),
    /// Revert every applied unit with a version greater than this one.
    To(Version),
}

impl Default for RevertTarget {
    fn default() -> Self {
        RevertTarget::Count(1)
    }
}

/// Outcome of one `apply_all` or `revert` run.
#[derive(Debug)]
pub struct RunReport {
    pub direction: Direction,
    /// Versions applied (or reverted, for `Down`) by this run, in order.
    pub applied: Vec<Version>,
    pub failed_at: Option<Version>,
    pub error: Option<Error>,
    pub warnings: Vec<String>,
    /// The run stopped between units because cancellation was requested.
    pub cancelled: bool,
}

impl RunReport {
    fn new(direction: Direction, warnings: Vec<String>) -> Self {
        Self {
            direction,
            applied: Vec::new(),
            failed_at: None,
            error: None,
            warnings,
            cancelled: false,
        }
    }

    fn fail(&mut self, version: Version, error: Error) {
        self.failed_at = Some(version);
        self.error = Some(error);
    }

    pub fn is_success(&self) -> bool {
        self.failed_at.is_none() && self.error.is_none() && !self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Applied,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: Version,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Read-only view of every known unit, in ascending version order.
pub fn status(units: &[Migration], ledger: &dyn Ledger) -> Result<Vec<MigrationStatus>> {
    let entries = ledger.entries()?;
    let (ordered, _) = order_units(units);
    Ok(ordered
        .into_iter()
        .map(|unit| {
            let entry = entries.iter().find(|e| e.matches(unit.version, &unit.name));
            MigrationStatus {
                version: unit.version,
                name: unit.name.clone(),
                state: if entry.is_some() {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                },
                applied_at: entry.map(|e| e.applied_at),
            }
        })
        .collect())
}

/// Sort units by version. Equal versions keep declaration order and are
/// reported as warnings.
fn order_units(units: &[Migration]) -> (Vec<&Migration>, Vec<String>) {
    let mut ordered: Vec<&Migration> = units.iter().collect();
    ordered.sort_by_key(|unit| unit.version);

    let warnings = ordered
        .windows(2)
        .filter(|pair| pair[0].version == pair[1].version)
        .map(|pair| {
            format!(
                "migrations `{}` and `{}` share version {}; using declaration order",
                pair[0].name, pair[1].name, pair[0].version
            )
        })
        .collect();
    (ordered, warnings)
}

/// Applies pending units and reverts applied ones against a store, keeping
/// the ledger in step.
pub struct MigrationRunner<'a, S: Store> {
    store: &'a S,
    ledger: &'a dyn Ledger,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, S: Store> MigrationRunner<'a, S> {
    pub fn new(store: &'a S, ledger: &'a dyn Ledger) -> Self {
        Self {
            store,
            ledger,
            cancel: None,
        }
    }

    /// Stop before the next unit once `flag` is set. A unit that has started
    /// always runs to completion.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn status(&self, units: &[Migration]) -> Result<Vec<MigrationStatus>> {
        status(units, self.ledger)
    }

    /// Apply every pending unit in ascending version order, up to and
    /// including `target` if given. Stops at the first failure.
    pub fn apply_all(&self, units: &[Migration], target: Option<Version>) -> Result<RunReport> {
        let (ordered, warnings) = prepare(units)?;

        self.store.with_lock(|| {
            self.reconcile(&ordered)?;

            let entries = self.ledger.entries()?;
            let latest_applied = entries.iter().map(|e| e.version).max();
            let pending: Vec<&Migration> = ordered
                .iter()
                .copied()
                .filter(|unit| !entries.iter().any(|e| e.matches(unit.version, &unit.name)))
                .filter(|unit| target.is_none_or(|t| unit.version <= t))
                .collect();

            if let (Some(first), Some(latest)) = (pending.first(), latest_applied)
                && first.version < latest
            {
                return Err(Error::Migration(format!(
                    "migration {} is older than the already applied {latest}; revert newer migrations first",
                    first.label()
                )));
            }

            let mut report = RunReport::new(Direction::Up, warnings);
            if pending.is_empty() {
                info!("no pending migrations");
                return Ok(report);
            }
            info!("applying {} pending migration(s)", pending.len());

            for unit in pending {
                if self.cancelled() {
                    warn!("cancelled before {}", unit.label());
                    report.cancelled = true;
                    break;
                }
                if let Err(e) = unit.up(self.store) {
                    error!("migration {} failed: {e}", unit.label());
                    report.fail(unit.version, Error::apply(unit.version, e));
                    break;
                }
                if let Err(e) = self.ledger.mark_applied(LedgerEntry::now(unit.version, &unit.name)) {
                    error!(
                        "migration {} changed the store but could not be recorded: {e}",
                        unit.label()
                    );
                    report.fail(unit.version, e);
                    break;
                }
                report.applied.push(unit.version);
            }

            info!("applied {} migration(s)", report.applied.len());
            Ok(report)
        })
    }

    /// Revert applied units in descending version order. Stops at the first
    /// failure.
    pub fn revert(&self, units: &[Migration], target: RevertTarget) -> Result<RunReport> {
        let (ordered, warnings) = prepare(units)?;

        self.store.with_lock(|| {
            self.reconcile(&ordered)?;

            let entries = self.ledger.entries()?;
            let applied = ordered
                .iter()
                .rev()
                .copied()
                .filter(|unit| entries.iter().any(|e| e.matches(unit.version, &unit.name)));
            let selected: Vec<&Migration> = match target {
                RevertTarget::Count(n) => applied.take(n).collect(),
                RevertTarget::To(version) => applied.filter(|unit| unit.version > version).collect(),
            };

            let mut report = RunReport::new(Direction::Down, warnings);
            if selected.is_empty() {
                info!("nothing to revert");
                return Ok(report);
            }
            info!("reverting {} migration(s)", selected.len());

            for unit in selected {
                if self.cancelled() {
                    warn!("cancelled before reverting {}", unit.label());
                    report.cancelled = true;
                    break;
                }
                if let Err(e) = unit.down(self.store) {
                    error!("reverting migration {} failed: {e}", unit.label());
                    report.fail(unit.version, Error::revert(unit.version, e));
                    break;
                }
                if let Err(e) = self.ledger.mark_reverted(unit.version, &unit.name) {
                    error!(
                        "migration {} was reverted in the store but the ledger still lists it: {e}",
                        unit.label()
                    );
                    report.fail(unit.version, e);
                    break;
                }
                report.applied.push(unit.version);
            }

            info!("reverted {} migration(s)", report.applied.len());
            Ok(report)
        })
    }

    /// Check that the live store is what the ledger says it should be.
    ///
    /// Every applied change is undone against the live schema, newest first,
    /// which recovers the schema the first migration started from. Collections
    /// the migrations own (their earliest unit creates them) are then dropped
    /// from that baseline and the ledger is replayed forward. Any mismatch
    /// with the live store for a collection a unit touches means a past run
    /// changed the store without recording it, or the other way round.
    fn reconcile(&self, ordered: &[&Migration]) -> Result<()> {
        let entries = self.ledger.entries()?;
        let live = self.store.snapshot()?;

        let mut applied = Vec::with_capacity(entries.len());
        for entry in &entries {
            let unit = ordered
                .iter()
                .copied()
                .find(|unit| entry.matches(unit.version, &unit.name))
                .ok_or_else(|| {
                    Error::OutOfSync(format!(
                        "ledger records migration {}_{} which is not among the known migrations",
                        entry.version, entry.name
                    ))
                })?;
            applied.push(unit);
        }

        let mut baseline = live.clone();
        for unit in applied.iter().rev() {
            unit.change.inverse().project(&mut baseline).map_err(|e| {
                Error::OutOfSync(format!(
                    "undoing {} against the live store failed: {e}",
                    unit.label()
                ))
            })?;
        }

        let mut expected = baseline.excluding(&owned_collections(ordered));
        for unit in &applied {
            unit.change.project(&mut expected).map_err(|e| {
                Error::OutOfSync(format!("replaying {} failed: {e}", unit.label()))
            })?;
        }

        let touched: BTreeSet<String> = ordered
            .iter()
            .map(|unit| unit.change.collection_id().to_string())
            .collect();
        let differences = expected.differences(&live, &touched);
        if !differences.is_empty() {
            for difference in &differences {
                error!("{difference}");
            }
            return Err(Error::OutOfSync(differences.join("; ")));
        }
        Ok(())
    }
}

/// Ids of collections whose earliest known unit creates them.
fn owned_collections(ordered: &[&Migration]) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut owned = BTreeSet::new();
    for unit in ordered {
        let id = unit.change.collection_id();
        if seen.insert(id.to_string())
            && matches!(unit.change, SchemaChange::CreateCollection { .. })
        {
            owned.insert(id.to_string());
        }
    }
    owned
}

/// Order units and validate all of them before anything touches the store.
fn prepare(units: &[Migration]) -> Result<(Vec<&Migration>, Vec<String>)> {
    let (ordered, warnings) = order_units(units);
    for warning in &warnings {
        warn!("{warning}");
    }
    for unit in &ordered {
        unit.validate()?;
    }
    Ok((ordered, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::memory_store::MemoryStore;
    use stratum_schema::{
        CollectionDescriptor, FieldDescriptor, FieldKind, FieldOptions, USERS_COLLECTION_ID,
    };

    fn create(version: u64, name: &str) -> Migration {
        Migration::new(
            version,
            format!("created_{name}"),
            SchemaChange::CreateCollection {
                collection: CollectionDescriptor::new(format!("id_{name}"), name)
                    .with_field(FieldDescriptor::new("label", FieldKind::Text)),
            },
        )
    }

    fn applied_versions(report: &RunReport) -> Vec<u64> {
        report.applied.iter().map(Version::as_u64).collect()
    }

    #[test]
    fn applies_in_version_order_regardless_of_input_order() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(3, "c"), create(1, "a"), create(2, "b")];

        let report = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap();
        assert!(report.is_success());
        assert_eq!(applied_versions(&report), vec![1, 2, 3]);

        let recorded: Vec<u64> = ledger
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.version.as_u64())
            .collect();
        assert_eq!(recorded, vec![1, 2, 3]);
    }

    #[test]
    fn second_apply_is_a_no_op() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(1, "a"), create(2, "b")];
        let runner = MigrationRunner::new(&store, &ledger);

        runner.apply_all(&units, None).unwrap();
        let before = store.snapshot().unwrap();

        let again = runner.apply_all(&units, None).unwrap();
        assert!(again.is_success());
        assert!(again.applied.is_empty());
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[test]
    fn halts_at_first_failure_and_keeps_earlier_units() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let broken = Migration::new(
            2u64,
            "created_broken",
            SchemaChange::CreateCollection {
                collection: CollectionDescriptor::new("id_broken", "broken").with_field(
                    FieldDescriptor::new("owner", FieldKind::Relation)
                        .with_options(FieldOptions::relation("does_not_exist", false)),
                ),
            },
        );
        let units = vec![create(1, "a"), broken, create(3, "c")];

        let report = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(applied_versions(&report), vec![1]);
        assert_eq!(report.failed_at, Some(Version::new(2)));
        assert!(matches!(
            report.error,
            Some(Error::Apply { version, .. }) if version == Version::new(2)
        ));

        assert!(store.find_collection("a").unwrap().is_some());
        assert!(store.find_collection("c").unwrap().is_none());
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn invalid_unit_aborts_before_any_mutation() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let mut bad = create(2, "b");
        if let SchemaChange::CreateCollection { collection } = &mut bad.change {
            collection.fields[0].name.clear();
        }
        let units = vec![create(1, "a"), bad];

        let err = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.find_collection("a").unwrap().is_none());
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn apply_respects_target_version() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(1, "a"), create(2, "b"), create(3, "c")];

        let report = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, Some(Version::new(2)))
            .unwrap();
        assert_eq!(applied_versions(&report), vec![1, 2]);
    }

    #[test]
    fn refuses_to_apply_older_unit_after_newer_one() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let runner = MigrationRunner::new(&store, &ledger);
        runner.apply_all(&[create(5, "e")], None).unwrap();

        let err = runner
            .apply_all(&[create(5, "e"), create(2, "b")], None)
            .unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
        assert!(store.find_collection("b").unwrap().is_none());
    }

    #[test]
    fn reverts_newest_first_by_count_and_by_target() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(1, "a"), create(2, "b"), create(3, "c"), create(4, "d")];
        let runner = MigrationRunner::new(&store, &ledger);
        runner.apply_all(&units, None).unwrap();

        let report = runner.revert(&units, RevertTarget::default()).unwrap();
        assert_eq!(report.direction, Direction::Down);
        assert_eq!(applied_versions(&report), vec![4]);

        let report = runner.revert(&units, RevertTarget::To(Version::new(1))).unwrap();
        assert_eq!(applied_versions(&report), vec![3, 2]);
        assert!(store.find_collection("a").unwrap().is_some());
        assert!(store.find_collection("b").unwrap().is_none());

        let report = runner.revert(&units, RevertTarget::Count(0)).unwrap();
        assert!(report.applied.is_empty());
    }

    #[test]
    fn full_revert_restores_initial_schema() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let initial = store.snapshot().unwrap();
        let units = vec![create(1, "a"), create(2, "b")];
        let runner = MigrationRunner::new(&store, &ledger);

        runner.apply_all(&units, None).unwrap();
        runner.revert(&units, RevertTarget::Count(10)).unwrap();
        assert!(store.snapshot().unwrap().same_shape(&initial));
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn same_version_units_run_in_declaration_order_with_warning() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(7, "first"), create(7, "second")];

        let report = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("share version 7"));

        let names: Vec<String> = ledger.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["created_first", "created_second"]);
    }

    #[test]
    fn cancellation_stops_before_the_next_unit() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let flag = Arc::new(AtomicBool::new(true));
        let units = vec![create(1, "a")];

        let report = MigrationRunner::new(&store, &ledger)
            .with_cancel_flag(flag)
            .apply_all(&units, None)
            .unwrap();
        assert!(report.cancelled);
        assert!(!report.is_success());
        assert!(report.applied.is_empty());
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn detects_store_changes_the_ledger_does_not_know_about() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(1, "a")];
        units[0].up(&store).unwrap();

        let err = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSync(_)));
        assert_eq!(store.collections().unwrap().len(), 2);
    }

    #[test]
    fn detects_unknown_ledger_entries() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        ledger.mark_applied(LedgerEntry::now(Version::new(99), "ghost")).unwrap();

        let err = MigrationRunner::new(&store, &ledger)
            .revert(&[create(1, "a")], RevertTarget::default())
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unmanaged_collections_are_ignored_by_reconciliation() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        store
            .create_collection(&CollectionDescriptor::new("manual", "manual"))
            .unwrap();

        let report = MigrationRunner::new(&store, &ledger)
            .apply_all(&[create(1, "a")], None)
            .unwrap();
        assert!(report.is_success());
    }

    #[test]
    fn status_lists_units_ascending_with_state() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(2, "b"), create(1, "a")];
        let runner = MigrationRunner::new(&store, &ledger);
        runner.apply_all(&units, Some(Version::new(1))).unwrap();

        let rows = runner.status(&units).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].version, Version::new(1));
        assert_eq!(rows[0].state, MigrationState::Applied);
        assert!(rows[0].applied_at.is_some());
        assert_eq!(rows[1].state, MigrationState::Pending);
        assert!(rows[1].applied_at.is_none());
    }

    #[test]
    fn lock_is_released_after_a_run() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        MigrationRunner::new(&store, &ledger)
            .apply_all(&[create(1, "a")], None)
            .unwrap();
        store.acquire_lock("after").unwrap();
    }

    #[test]
    fn held_lock_blocks_a_run() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        store.acquire_lock("someone-else").unwrap();
        let err = MigrationRunner::new(&store, &ledger)
            .apply_all(&[create(1, "a")], None)
            .unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
        assert!(store.find_collection("a").unwrap().is_none());
    }

    fn add_phone_to_users(version: u64) -> Migration {
        Migration::new(
            version,
            "add_users_phone",
            SchemaChange::AddField {
                collection_id: USERS_COLLECTION_ID.to_string(),
                field: FieldDescriptor::new("phone", FieldKind::Text),
            },
        )
    }

    #[test]
    fn alters_collections_no_migration_created() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![create(1, "a"), add_phone_to_users(2)];
        let runner = MigrationRunner::new(&store, &ledger);

        let report = runner.apply_all(&units, None).unwrap();
        assert_eq!(applied_versions(&report), vec![1, 2]);
        let users = store.find_collection(USERS_COLLECTION_ID).unwrap().unwrap();
        assert!(users.field("phone").is_some());

        let again = runner.apply_all(&units, None).unwrap();
        assert!(again.is_success());
        assert!(again.applied.is_empty());

        let report = runner.revert(&units, RevertTarget::default()).unwrap();
        assert_eq!(applied_versions(&report), vec![2]);
        let users = store.find_collection(USERS_COLLECTION_ID).unwrap().unwrap();
        assert!(users.field("phone").is_none());
    }

    #[test]
    fn deletes_a_hand_made_collection_and_restores_it_on_revert() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let legacy = CollectionDescriptor::new("legacy01", "legacy")
            .with_field(FieldDescriptor::new("payload", FieldKind::Json));
        store.create_collection(&legacy).unwrap();
        let units = vec![Migration::new(
            1u64,
            "deleted_legacy",
            SchemaChange::DeleteCollection {
                collection: legacy.clone(),
            },
        )];
        let runner = MigrationRunner::new(&store, &ledger);

        runner.apply_all(&units, None).unwrap();
        assert!(store.find_collection("legacy").unwrap().is_none());

        let again = runner.apply_all(&units, None).unwrap();
        assert!(again.applied.is_empty());

        runner.revert(&units, RevertTarget::default()).unwrap();
        assert_eq!(store.find_collection("legacy").unwrap(), Some(legacy));
    }

    #[test]
    fn detects_drift_on_collections_no_migration_created() {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let units = vec![add_phone_to_users(1)];
        ledger
            .mark_applied(LedgerEntry::now(Version::new(1), "add_users_phone"))
            .unwrap();

        let err = MigrationRunner::new(&store, &ledger)
            .apply_all(&units, None)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSync(_)));
        assert!(err.to_string().contains("add_users_phone"));
    }

    /// Ledger that refuses to record or unrecord one version.
    struct RefusingLedger {
        inner: MemoryLedger,
        refuse: Version,
    }

    impl Ledger for RefusingLedger {
        fn entries(&self) -> Result<Vec<LedgerEntry>> {
            self.inner.entries()
        }

        fn mark_applied(&self, entry: LedgerEntry) -> Result<()> {
            if entry.version == self.refuse {
                return Err(Error::Ledger("disk full".into()));
            }
            self.inner.mark_applied(entry)
        }

        fn mark_reverted(&self, version: Version, name: &str) -> Result<()> {
            if version == self.refuse {
                return Err(Error::Ledger("disk full".into()));
            }
            self.inner.mark_reverted(version, name)
        }
    }

    #[test]
    fn unrecorded_apply_halts_the_run_and_is_caught_next_time() {
        let store = MemoryStore::new();
        let ledger = RefusingLedger {
            inner: MemoryLedger::new(),
            refuse: Version::new(2),
        };
        let units = vec![create(1, "a"), create(2, "b"), create(3, "c")];
        let runner = MigrationRunner::new(&store, &ledger);

        let report = runner.apply_all(&units, None).unwrap();
        assert_eq!(applied_versions(&report), vec![1]);
        assert_eq!(report.failed_at, Some(Version::new(2)));
        assert!(matches!(report.error, Some(Error::Ledger(_))));
        assert!(store.find_collection("b").unwrap().is_some());
        assert!(store.find_collection("c").unwrap().is_none());
        assert_eq!(ledger.entries().unwrap().len(), 1);

        let err = runner.apply_all(&units, None).unwrap_err();
        assert!(matches!(err, Error::OutOfSync(_)));
        assert!(store.find_collection("c").unwrap().is_none());
    }

    #[test]
    fn unrecorded_revert_halts_the_run_and_is_caught_next_time() {
        let store = MemoryStore::new();
        let ledger = RefusingLedger {
            inner: MemoryLedger::new(),
            refuse: Version::new(3),
        };
        let units = vec![create(1, "a"), create(2, "b")];
        let runner = MigrationRunner::new(&store, &ledger);
        runner.apply_all(&units, None).unwrap();

        let all = vec![create(1, "a"), create(2, "b"), create(3, "c")];
        ledger
            .inner
            .mark_applied(LedgerEntry::now(Version::new(3), "created_c"))
            .unwrap();
        all[2].up(&store).unwrap();

        let report = runner.revert(&all, RevertTarget::Count(2)).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.failed_at, Some(Version::new(3)));
        assert!(matches!(report.error, Some(Error::Ledger(_))));
        assert!(store.find_collection("c").unwrap().is_none());
        assert!(store.find_collection("b").unwrap().is_some());

        let err = runner.revert(&all, RevertTarget::default()).unwrap_err();
        assert!(matches!(err, Error::OutOfSync(_)));
    }
}
