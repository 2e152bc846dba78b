// Debt sheet ejection/inclusion across tag partitions

use std::collections::HashMap;
use std::fs;

use loan_tape::{
    Condition, Config, DebtSheetWorkflow, Datatype, MetadataStore, Operator, Outcome, PrepareOptions,
    RulePayload, RuleRunResult, SqliteStore, SystemColumn, TagRules,
};
use tempfile::TempDir;

struct Book {
    _dir: TempDir,
    store: SqliteStore,
    config: Config,
    project_id: String,
}

/// Partition A: 10 loans, three above 100. B: 2 loans. Untagged: 2 loans.
fn book() -> Book {
    let dir = TempDir::new().unwrap();
    let config = Config {
        datasets_root: dir.path().join("data"),
        ..Config::default()
    };
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .upsert_system_column(&SystemColumn::new("amount", Datatype::Number))
        .unwrap();

    let mut csv = String::from("loan_id,amount,tag_name,tag_type\n");
    for (i, amount) in [50, 150, 60, 200, 70, 80, 300, 90, 95, 100].iter().enumerate() {
        csv.push_str(&format!("A{i},{amount},A,pool\n"));
    }
    csv.push_str("B0,20,B,pool\nB1,30,B,pool\n");
    csv.push_str("U0,10,,\nU1,40,,\n");
    let upload = dir.path().join("book.csv");
    fs::write(&upload, csv).unwrap();

    let workflow = DebtSheetWorkflow::new(&store, &config);
    let project_id = workflow
        .init_project("Scenario", &upload, &PrepareOptions::default())
        .unwrap()
        .project_id;
    let partitions = workflow.split_by_tags(&project_id).unwrap();
    let flagged: Vec<String> = partitions
        .iter()
        .filter(|p| p.tag_name != "Untagged")
        .map(|p| p.version_id.clone())
        .collect();
    workflow
        .set_sent_for_rule_addition(&project_id, &flagged, true)
        .unwrap();

    Book {
        _dir: dir,
        store,
        config,
        project_id,
    }
}

fn above_100(outcome: Outcome) -> Vec<Vec<Condition>> {
    vec![vec![Condition::new("amount", Operator::GreaterThan, "100").then(outcome)]]
}

fn rows_by_tag(store: &SqliteStore, result: &RuleRunResult) -> HashMap<String, usize> {
    result
        .new_versions
        .iter()
        .map(|entry| {
            let version = store.require_version(&entry.version_id).unwrap();
            (version.tag_name().to_lowercase(), version.rows_count)
        })
        .collect()
}

#[test]
fn test_eject_then_include_moves_the_same_rows() {
    let b = book();
    let payload = RulePayload {
        ejection: vec![TagRules::new("A", "pool", above_100(Outcome::Reject))],
        acception_rules_for_all_files: vec![TagRules::new("B", "pool", above_100(Outcome::Accept))],
    };

    let result = DebtSheetWorkflow::new(&b.store, &b.config)
        .apply_rules(&b.project_id, &payload)
        .unwrap();

    assert_eq!(result.ejection_results[0].ejected_rows, 3);
    assert_eq!(result.inclusion_results[0].added_rows, 3);
    let rows = rows_by_tag(&b.store, &result);
    assert_eq!(rows["a"], 7);
    assert_eq!(rows["b"], 5);
    assert_eq!(rows["untagged"], 2);
    assert_eq!(rows.values().sum::<usize>(), 14);
}

#[test]
fn test_ejection_accept_and_reject_are_complementary() {
    let b = book();
    let workflow = DebtSheetWorkflow::new(&b.store, &b.config);
    let run = |outcome| {
        let payload = RulePayload {
            ejection: vec![TagRules::new("A", "pool", above_100(outcome))],
            acception_rules_for_all_files: vec![],
        };
        workflow.apply_rules(&b.project_id, &payload).unwrap()
    };

    let rejected = run(Outcome::Reject);
    let accepted = run(Outcome::Accept);

    assert_eq!(rejected.ejection_results[0].ejected_rows, 3);
    assert_eq!(accepted.ejection_results[0].ejected_rows, 7);
    let rows = rows_by_tag(&b.store, &accepted);
    assert_eq!(rows["a"], 3);
    assert_eq!(rows["untagged"], 9);
    assert_eq!(rows.values().sum::<usize>(), 14);
}

#[test]
fn test_rows_are_conserved_across_finalize() {
    let b = book();
    let workflow = DebtSheetWorkflow::new(&b.store, &b.config);
    let payload = RulePayload {
        ejection: vec![TagRules::new("A", "pool", above_100(Outcome::Reject))],
        acception_rules_for_all_files: vec![],
    };

    let result = workflow.apply_rules(&b.project_id, &payload).unwrap();
    assert_eq!(result.rows_removed_files.len(), 1);
    let finalized = workflow.finalize_temp_versions(&b.project_id).unwrap();

    assert_eq!(finalized.combined_rows, 14);
    let events = b.store.events_for("project", &b.project_id).unwrap();
    assert!(events.iter().any(|e| e.event_type == "rules_applied"));
}

#[test]
fn test_second_run_replaces_row_tracking_files() {
    let b = book();
    let workflow = DebtSheetWorkflow::new(&b.store, &b.config);
    let first = workflow
        .apply_rules(
            &b.project_id,
            &RulePayload {
                ejection: vec![TagRules::new("A", "pool", above_100(Outcome::Reject))],
                acception_rules_for_all_files: vec![],
            },
        )
        .unwrap();
    let stale: Vec<_> = first
        .rows_removed_files
        .iter()
        .chain(&first.rows_added_files)
        .map(|entry| b.store.require_version(&entry.version_id).unwrap())
        .collect();
    assert_eq!(stale.len(), 1);

    let over_200 = vec![vec![Condition::new("amount", Operator::GreaterThan, "200").then(Outcome::Reject)]];
    let second = workflow
        .apply_rules(
            &b.project_id,
            &RulePayload {
                ejection: vec![TagRules::new("A", "pool", over_200)],
                acception_rules_for_all_files: vec![TagRules::new("B", "pool", above_100(Outcome::Accept))],
            },
        )
        .unwrap();

    for version in &stale {
        assert!(b.store.get_version(&version.id).unwrap().is_none());
        assert!(!version.file_path.exists());
    }
    assert_eq!(second.ejection_results[0].ejected_rows, 1);
    assert_eq!(second.rows_removed_files.len(), 1);
    assert_eq!(second.rows_added_files.len(), 1);
    let project = b.store.require_project(&b.project_id).unwrap();
    assert_eq!(project.rows_removed_files, second.rows_removed_files);
    assert_eq!(project.rows_added_files, second.rows_added_files);
}
