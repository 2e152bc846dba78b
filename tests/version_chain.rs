// Transaction workflow through to rule version chains

use std::fs;

use loan_tape::calculated::ColumnRef;
use loan_tape::{
    CalcOp, ChainViolation, Condition, Config, Datatype, Fragment, MetadataStore, Operand, Operator, Outcome,
    PipelineError, RbiSelection, RuleGroup, SqliteStore, SystemColumn, TransactionWorkflow, VersionChainManager,
};
use tempfile::TempDir;

struct Deal {
    _dir: TempDir,
    store: SqliteStore,
    config: Config,
    transaction_id: String,
}

/// Twelve loans, two of them overdue, with a calculated exposure column
fn deal() -> Deal {
    let dir = TempDir::new().unwrap();
    let config = Config {
        datasets_root: dir.path().join("data"),
        ..Config::default()
    };
    let store = SqliteStore::open_in_memory().unwrap();
    for (name, datatype) in [("loan_amount", Datatype::Currency), ("interest", Datatype::Number), ("dpd", Datatype::Number)] {
        store.upsert_system_column(&SystemColumn::new(name, datatype)).unwrap();
    }

    let mut csv = String::from("transaction_id,loan_amount,interest,dpd\n");
    for i in 0..12 {
        let dpd = if i % 6 == 5 { 45 } else { 0 };
        csv.push_str(&format!("T{i},{},{},{dpd}\n", (i + 1) * 1000, i * 10));
    }
    let upload = dir.path().join("deal.csv");
    fs::write(&upload, csv).unwrap();

    let workflow = TransactionWorkflow::new(&store, &config);
    let transaction_id = workflow
        .init_transaction("Deal", &upload, &Default::default())
        .unwrap()
        .transaction_id;

    workflow.start_new_column_phase(&transaction_id).unwrap();
    workflow
        .add_column_with_rules(
            &transaction_id,
            "exposure",
            &[Fragment::calculation(
                "loan_amount",
                CalcOp::Add,
                Operand::Column(ColumnRef::parse("interest")),
            )],
        )
        .unwrap();
    workflow.finalize_new_columns(&transaction_id).unwrap();

    let selection = RbiSelection {
        overdue: true,
        ..RbiSelection::default()
    };
    let applied = workflow.apply_rbi_rules(&transaction_id, &selection).unwrap();
    assert_eq!(applied.report.stats_after.rows, 10);

    Deal {
        _dir: dir,
        store,
        config,
        transaction_id,
    }
}

fn manager(d: &Deal) -> VersionChainManager<'_, SqliteStore> {
    VersionChainManager::new(&d.store, &d.config, d.store.column_catalog().unwrap())
}

/// Drop loans whose exposure is above `limit`
fn cap(limit: u32) -> Vec<RuleGroup> {
    vec![vec![
        Condition::new("exposure", Operator::GreaterThan, limit.to_string()).then(Outcome::Reject),
    ]]
}

#[test]
fn test_chain_uses_calculated_column_datatype() {
    let d = deal();
    let root = manager(&d).create_root(&d.transaction_id, &cap(9000), None).unwrap();

    // Compared as text, "10090" would sort below "9000"
    assert_eq!(root.stats_before.rows, 10);
    assert_eq!(root.stats_after.rows, 7);
    assert_eq!(root.rules_results.total_rows_removed, 3);
}

#[test]
fn test_single_child_invariant() {
    let d = deal();
    let m = manager(&d);
    let root = m.create_root(&d.transaction_id, &cap(9000), None).unwrap();
    m.append_child(&d.transaction_id, &root.version_id, &cap(7000), None).unwrap();
    let versions = d.store.versions_for_owner(&d.transaction_id).unwrap().len();

    let err = m
        .append_child(&d.transaction_id, &root.version_id, &cap(5000), None)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Chain(ChainViolation::AlreadyHasChild { .. })));
    assert_eq!(d.store.versions_for_owner(&d.transaction_id).unwrap().len(), versions);
    assert!(m.create_root(&d.transaction_id, &cap(5000), None).is_ok());
}

#[test]
fn test_deleting_middle_node_renumbers_chain() {
    let d = deal();
    let m = manager(&d);
    let root = m.create_root(&d.transaction_id, &cap(9000), None).unwrap();
    let v1 = m.append_child(&d.transaction_id, &root.version_id, &cap(8000), None).unwrap();
    let v2 = m.append_child(&d.transaction_id, &v1.version_id, &cap(6000), None).unwrap();
    let v3 = m.append_child(&d.transaction_id, &v2.version_id, &cap(4000), None).unwrap();
    assert_eq!(v3.branch_number, 3);

    let deletion = m.delete(&d.transaction_id, &v1.version_id, false).unwrap();
    assert_eq!(deletion.deleted_versions, vec![v1.version_id.clone()]);

    let chain = m.get_version_chain(&v3.version_id).unwrap();
    let order: Vec<(&str, u32)> = chain
        .chain
        .iter()
        .map(|step| (step.version_id.as_str(), step.branch_number))
        .collect();
    assert_eq!(
        order,
        vec![
            (root.version_id.as_str(), 0),
            (v2.version_id.as_str(), 1),
            (v3.version_id.as_str(), 2),
        ]
    );
    let v2_record = d.store.require_version(&v2.version_id).unwrap();
    assert_eq!(
        v2_record.chain.unwrap().parent_version_id.as_deref(),
        Some(root.version_id.as_str())
    );
}

#[test]
fn test_boolean_marker_with_only_calculation_is_rejected() {
    let d = deal();
    let workflow = TransactionWorkflow::new(&d.store, &d.config);
    workflow.start_new_column_phase(&d.transaction_id).unwrap();

    let err = workflow
        .add_column_with_rules(
            &d.transaction_id,
            "is_large",
            &[
                Fragment::boolean(true),
                Fragment::calculation("loan_amount", CalcOp::Add, Operand::Static("1".into())),
            ],
        )
        .unwrap_err();

    assert!(matches!(err, PipelineError::BooleanExpected { .. }));
    let transaction = d.store.require_transaction(&d.transaction_id).unwrap();
    assert!(!transaction.new_added_columns_datatype.contains_key("is_large"));
}

#[test]
fn test_promoted_root_keeps_its_place() {
    let d = deal();
    let m = manager(&d);
    let first = m.create_root(&d.transaction_id, &cap(9000), None).unwrap();
    let child = m.append_child(&d.transaction_id, &first.version_id, &cap(7000), None).unwrap();
    let second = m.create_root(&d.transaction_id, &cap(8000), None).unwrap();

    let deletion = m.delete(&d.transaction_id, &first.version_id, false).unwrap();

    assert!(deletion.promoted_to_root);
    let transaction = d.store.require_transaction(&d.transaction_id).unwrap();
    assert_eq!(
        transaction.rule_application_root_versions,
        vec![child.version_id.clone(), second.version_id.clone()]
    );
    let promoted = d.store.require_version(&child.version_id).unwrap().chain.unwrap();
    assert_eq!((promoted.branch_level, promoted.parent_version_id), (0, None));
}
