use std::collections::BTreeSet;

use color_eyre::{eyre::bail, Result};
use tracing::info;
use vaultpref_core::value::TypedValue;
use vaultpref_migrate::{migrate, JsonSnapshot};
use vaultpref_storage::EntryStore;

use crate::cli::{Command, ValueType};

const PROBE_KEY: &str = "health/probe";

/// Execute a store command. Blocks on disk I/O.
pub fn run(command: Command, store: &EntryStore) -> Result<()> {
    match command {
        Command::Get { key } => match store.get(&key)? {
            Some(value) => println!("{}", render(&value)),
            None => bail!("no value stored under {key}"),
        },
        Command::Put {
            key,
            value,
            kind,
            apply,
        } => {
            let value = parse_value(kind, &value)?;
            finish(store.edit().put(key, value), apply)?;
        }
        Command::Remove { keys, apply } => {
            let editor = keys.into_iter().fold(store.edit(), |e, key| e.remove(key));
            finish(editor, apply)?;
        }
        Command::List => {
            for (key, value) in store.get_all()? {
                println!("{key} = {}", render(&value));
            }
        }
        Command::Clear { apply } => finish(store.edit().clear(), apply)?,
        Command::Import { path, apply } => {
            let report = migrate(&JsonSnapshot::new(&path), store, !apply)?;
            println!(
                "Imported {} value(s), skipped {}",
                report.migrated,
                report.skipped.len()
            );
            for key in report.skipped {
                println!("  skipped {key}");
            }
        }
        Command::Health => {
            run_store_health(store)?;
            let recovery = store.recovery();
            println!("Storage: ok ({:?})", store.algorithm());
            if let Some(at) = recovery.truncated_at {
                println!(
                    "Recovery: discarded {} byte(s) at offset {at}",
                    recovery.discarded_bytes
                );
            }
        }
        Command::Config(_) | Command::Version => {}
    }
    Ok(())
}

fn finish(editor: vaultpref_storage::Editor<'_>, apply: bool) -> Result<()> {
    if apply {
        editor.apply()?;
    } else {
        editor.commit()?;
    }
    Ok(())
}

/// Round-trip a probe through encrypt, journal, decrypt and remove.
pub fn run_store_health(store: &EntryStore) -> Result<()> {
    let payload = "ok";
    store.edit().put_string(PROBE_KEY, payload).commit()?;
    let round_trip = store.get_string(PROBE_KEY, "")?;
    store.edit().remove(PROBE_KEY).commit()?;

    if round_trip != payload || store.contains(PROBE_KEY) {
        bail!("storage round-trip failed");
    }
    info!("storage health probe passed");
    Ok(())
}

fn parse_value(kind: ValueType, words: &[String]) -> Result<TypedValue> {
    Ok(match kind {
        ValueType::String => TypedValue::String(words.join(" ")),
        ValueType::Int => TypedValue::Int(single(kind, words)?.parse()?),
        ValueType::Long => TypedValue::Long(single(kind, words)?.parse()?),
        ValueType::Float => TypedValue::Float(single(kind, words)?.parse()?),
        ValueType::Bool => TypedValue::Bool(single(kind, words)?.parse()?),
        ValueType::StringSet => TypedValue::StringSet(words.iter().cloned().collect()),
    })
}

fn single(kind: ValueType, words: &[String]) -> Result<&str> {
    match words {
        [word] => Ok(word.as_str()),
        _ => bail!("{kind:?} takes exactly one value, got {}", words.len()),
    }
}

fn render(value: &TypedValue) -> String {
    match value {
        TypedValue::String(v) => v.clone(),
        TypedValue::Int(v) => v.to_string(),
        TypedValue::Long(v) => v.to_string(),
        TypedValue::Float(v) => v.to_string(),
        TypedValue::Bool(v) => v.to_string(),
        TypedValue::StringSet(set) => render_set(set),
    }
}

fn render_set(set: &BTreeSet<String>) -> String {
    let items: Vec<&str> = set.iter().map(String::as_str).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    #[test]
    fn health_check_with_test_store_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path());
        run_store_health(&store).expect("health check should succeed");
        assert!(store.is_empty());
    }

    #[test]
    fn put_get_remove_through_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path());

        run(
            Command::Put {
                key: "tags".into(),
                value: vec!["b".into(), "a".into()],
                kind: ValueType::StringSet,
                apply: true,
            },
            &store,
        )
        .expect("put");
        assert_eq!(
            store.get("tags").expect("get").as_ref().map(render),
            Some("[a, b]".to_string())
        );

        run(
            Command::Remove {
                keys: vec!["tags".into()],
                apply: false,
            },
            &store,
        )
        .expect("remove");
        assert!(run(Command::Get { key: "tags".into() }, &store).is_err());
    }

    #[test]
    fn import_reads_a_json_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = storage::test_store(dir.path().join("store"));
        let snapshot = dir.path().join("prefs.json");
        std::fs::write(
            &snapshot,
            r#"{"n": {"type": "long", "value": 9}, "d": {"type": "double", "value": 1.5}}"#,
        )
        .expect("write snapshot");

        run(
            Command::Import {
                path: snapshot,
                apply: false,
            },
            &store,
        )
        .expect("import");
        assert_eq!(store.get_long("n", 0).expect("n"), 9);
        assert!(!store.contains("d"));
    }

    #[test]
    fn parse_value_checks_arity_and_format() {
        let words = |w: &[&str]| w.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            parse_value(ValueType::Int, &words(&["-4"])).expect("int"),
            TypedValue::Int(-4)
        );
        assert_eq!(
            parse_value(ValueType::String, &words(&["a", "b"])).expect("string"),
            TypedValue::String("a b".into())
        );
        assert!(parse_value(ValueType::Int, &words(&["1", "2"])).is_err());
        assert!(parse_value(ValueType::Bool, &words(&["maybe"])).is_err());
    }
}
