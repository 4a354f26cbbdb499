//! A small notes app whose schema grows over three releases, showing
//! apply, dry runs, drift checks, and squashing.
//!
//! Run with: `cargo run -p keva-example-notes`

use std::process::ExitCode;
use std::sync::Arc;

use keva_migrate::{
    expected_schema, run, snapshot, squash_migrations, validate_schema, validate_squash,
    ApplyOptions, HookError, Migration, MigrationHooks, SquashOptions, StoreTxn, VersionedStore,
};
use keva_store::MemoryStore;
use serde_json::json;

/// Release 2 splits the single `body` field into `title` + `body`.
struct SplitTitle;

impl MigrationHooks for SplitTitle {
    fn transform(&self, tx: &mut dyn StoreTxn) -> Result<(), HookError> {
        for (key, mut note) in tx.scan("notes").map_err(|e| HookError(e.to_string()))? {
            let body = note["body"].as_str().unwrap_or("").to_string();
            let (title, rest) = match body.split_once('\n') {
                Some((first, rest)) => (first.to_string(), rest.to_string()),
                None => (body, String::new()),
            };
            note["title"] = json!(title);
            note["body"] = json!(rest);
            tx.put("notes", &key, note)
                .map_err(|e| HookError(e.to_string()))?;
        }
        Ok(())
    }

    fn validate(&self, tx: &mut dyn StoreTxn) -> Result<bool, HookError> {
        let notes = tx.scan("notes").map_err(|e| HookError(e.to_string()))?;
        Ok(notes.iter().all(|(_, n)| n["title"].is_string()))
    }

    fn has_transform(&self) -> bool {
        true
    }
    fn has_validate(&self) -> bool {
        true
    }
}

/// Release 1 ships with some seed content.
struct SeedNotes;

impl MigrationHooks for SeedNotes {
    fn transform(&self, tx: &mut dyn StoreTxn) -> Result<(), HookError> {
        tx.put(
            "notes",
            "n1",
            json!({"id": "n1", "body": "Groceries\nmilk, eggs, coffee"}),
        )
        .map_err(|e| HookError(e.to_string()))?;
        tx.put("notes", "n2", json!({"id": "n2", "body": "Call the landlord"}))
            .map_err(|e| HookError(e.to_string()))
    }
    fn has_transform(&self) -> bool {
        true
    }
}

fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "create_notes")
            .with_store("notes", "id,body")
            .with_hooks(Arc::new(SeedNotes)),
        Migration::new(2, "split_title")
            .with_store("notes", "id,title,body")
            .with_hooks(Arc::new(SplitTitle)),
        Migration::new(3, "add_notebooks")
            .with_store("notebooks", "++id,&name")
            .with_store("notes", "id,title,body,notebook_id"),
    ]
}

fn main() -> ExitCode {
    let mut store = MemoryStore::new();
    let set = migrations();

    // Preview what a run would do.
    match run(&mut store, &set, ApplyOptions::dry_run()) {
        Ok(report) => println!("dry run: pending ids {:?}", report.pending),
        Err(e) => {
            eprintln!("dry run failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    // Apply for real, with progress reporting.
    let options = ApplyOptions::default()
        .on_progress(Arc::new(|ordinal, total| {
            println!("applying migration {ordinal}/{total}");
        }))
        .on_complete(Arc::new(|| println!("all migrations applied")));
    let report = match run(&mut store, &set, options) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("migration failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "applied {:?}, store is now at version {}",
        report.applied, report.final_version
    );

    for (key, note) in store.read_table("notes").unwrap_or_default() {
        println!("  {key}: {} — {}", note["title"], note["body"]);
    }

    // Drift check: the live schema should match what the set declares.
    match snapshot(&store, &set) {
        Ok(snap) => {
            let result = validate_schema(&snap, &expected_schema(&set));
            println!(
                "drift check: valid={}, {} warning(s)",
                result.valid,
                result.warnings.len()
            );
        }
        Err(e) => {
            eprintln!("snapshot failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    // Years later: compact the early history into one base migration.
    let squash_report = validate_squash(&set, 2);
    for warning in &squash_report.warnings {
        println!("squash warning: {warning}");
    }
    match squash_migrations(&set, &SquashOptions::up_to(2)) {
        Ok(outcome) => {
            println!(
                "squashed ids {:?} into `{}`; {} migration(s) remain",
                outcome.squashed_ids,
                outcome.base.name,
                outcome.remaining.len()
            );
        }
        Err(e) => {
            eprintln!("squash failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
