//! Randomized and hostile inputs for predicate compilation.
//!
//! Values must only ever travel as bound parameters: whatever a caller passes, the
//! rendered SQL text stays the same and the parameter count matches the placeholders.

mod common;

use common::{MockProvider, provider};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tempfile::NamedTempFile;
use txsql::config::DataSourceConfig;
use txsql::db::{Database, Dialect, SqlValue, SqlxProvider};

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate various edge-case strings
fn edge_case_strings() -> Vec<String> {
    vec![
        String::new(),                       // Empty
        " ".to_string(),                     // Single space
        "\n\r\t".to_string(),                // Whitespace chars
        "🚀".repeat(100),                    // Unicode
        "'OR 1=1--".to_string(),             // SQL injection
        "'; DROP TABLE users--".to_string(), // SQL injection
        "1' UNION SELECT NULL, NULL--".to_string(),
        "$1".to_string(),  // Placeholder lookalike
        "?".to_string(),   // Placeholder lookalike
        "\"id\"".to_string(),
        "a".repeat(10000), // Very long string
        random_string(100),
        random_string(1000),
    ]
}

#[test]
fn test_values_never_reach_sql_text() {
    let mock = MockProvider::postgres();
    let db = Database::new(provider(&mock));

    for value in edge_case_strings() {
        let statement = db
            .select("users")
            .filter([("name", value.clone())])
            .statement()
            .unwrap();
        assert_eq!(statement.sql, r#"select * from "users" where "name" = $1"#);
        assert_eq!(statement.params, vec![SqlValue::Text(value)]);
    }
}

#[test]
fn test_random_in_lists_number_placeholders() {
    let mut rng = rand::thread_rng();

    for dialect in [Dialect::Postgres, Dialect::Sqlite] {
        let mock = MockProvider::new(dialect);
        let db = Database::new(provider(&mock));

        for _ in 0..200 {
            let ids: Vec<i64> = (0..rng.gen_range(0..40)).map(|_| rng.r#gen()).collect();
            let statement = db
                .select("users")
                .filter([("status", "active")])
                .and(("id", ids.clone()))
                .statement()
                .unwrap();

            if ids.is_empty() {
                assert!(statement.sql.ends_with(" and 1 = 0"));
            }
            assert_eq!(statement.params.len(), ids.len() + 1);
            let expected_last = match dialect {
                Dialect::Postgres => format!("${}", ids.len() + 1),
                Dialect::Sqlite => "?".to_string(),
            };
            if !ids.is_empty() {
                assert!(statement.sql.ends_with(&format!("{})", expected_last)));
            }
            let placeholders = match dialect {
                Dialect::Postgres => statement.sql.matches('$').count(),
                Dialect::Sqlite => statement.sql.matches('?').count(),
            };
            assert_eq!(placeholders, statement.params.len());
        }
    }
}

#[tokio::test]
async fn test_hostile_strings_round_trip_through_sqlite() {
    let path = NamedTempFile::new()
        .unwrap()
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let config = DataSourceConfig::parse(&format!("sqlite:{}", path)).unwrap();
    let sqlx_provider = std::sync::Arc::new(SqlxProvider::connect(&config).await.unwrap());
    let db = Database::new(sqlx_provider.clone());

    db.exec("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[])
        .await
        .unwrap();

    for (i, body) in edge_case_strings().into_iter().enumerate() {
        let id = i as i64;
        db.insert("notes")
            .set([("id", SqlValue::Int(id)), ("body", SqlValue::Text(body.clone()))])
            .run()
            .await
            .unwrap();

        let stored: String = db
            .select("notes")
            .filter([("body", body.clone())])
            .map(|row| row.get("body"))
            .one()
            .await
            .unwrap();
        assert_eq!(stored, body);
    }

    assert_eq!(
        db.count("notes", txsql::predicates![]).await.unwrap(),
        edge_case_strings().len() as i64
    );
    sqlx_provider.close().await;
}
