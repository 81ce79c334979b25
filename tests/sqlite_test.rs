//! End-to-end tests against a real SQLite database file.
//!
//! Tests verify that:
//! - Builders run unchanged against the sqlx-backed provider
//! - Committed work is visible afterwards, rolled back work is not
//! - Keys assigned by the database come back through `returning`
//! - Column values decode into the expected Rust types
//!
//! Set `TEST_POSTGRES_URL` to also run the PostgreSQL smoke test.

use std::sync::Arc;
use tempfile::NamedTempFile;
use txsql::config::DataSourceConfig;
use txsql::db::{
    ConnectionProvider, Database, GeneratedKey, OnConflict, Provider, RequestTransactionScope,
    SqlValue, SqlxProvider, Transaction, TransactionExt,
};
use txsql::{DbError, predicates};

fn temp_db_path() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    // Keep the temp file alive - prevent deletion when function returns
    temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn connect(url: &str) -> (Arc<SqlxProvider>, Database) {
    let config = DataSourceConfig::parse(url).unwrap();
    let sqlx_provider = Arc::new(SqlxProvider::connect(&config).await.unwrap());
    let provider: Provider = sqlx_provider.clone();
    (sqlx_provider, Database::new(provider))
}

/// Create a SQLite database file with a `users` table.
async fn setup_db_at(path: &str) -> (Arc<SqlxProvider>, Database) {
    let (sqlx_provider, db) = connect(&format!("sqlite:{}", path)).await;
    db.exec(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            score REAL,
            active BOOLEAN NOT NULL DEFAULT 1,
            avatar BLOB
        )",
        &[],
    )
    .await
    .unwrap();

    (sqlx_provider, db)
}

async fn setup_db() -> (Arc<SqlxProvider>, Database) {
    setup_db_at(&temp_db_path()).await
}

async fn user_count(db: &Database) -> i64 {
    db.count("users", txsql::predicates![]).await.unwrap()
}

#[tokio::test]
async fn test_insert_select_update_delete() {
    let (provider, db) = setup_db().await;

    let id = GeneratedKey::<i64>::new();
    let inserted = db
        .insert("users")
        .set(predicates!["id" => id.clone(), "email" => "ada@example.com", "name" => "Ada"])
        .run()
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    let id = id.value().unwrap();
    assert!(id > 0);

    let name: String = db
        .select("users")
        .filter([("id", id)])
        .map(|row| row.get("name"))
        .one()
        .await
        .unwrap();
    assert_eq!(name, "Ada");

    let updated = db
        .update("users")
        .set([("name", "Ada Lovelace")])
        .filter([("id", id)])
        .run()
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let deleted = db.delete("users").filter([("id", id)]).run().await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(user_count(&db).await, 0);

    provider.close().await;
}

#[tokio::test]
async fn test_multi_row_insert_and_in_filter() {
    let (provider, db) = setup_db().await;

    db.insert("users")
        .set([("email", "a@example.com")])
        .row([("email", "b@example.com")])
        .row([("email", "c@example.com")])
        .run()
        .await
        .unwrap();

    let emails: Vec<String> = db
        .select("users")
        .filter([("email", vec!["a@example.com", "c@example.com"])])
        .order("email", false)
        .map(|row| row.get("email"))
        .list()
        .await
        .unwrap();
    assert_eq!(emails, vec!["c@example.com", "a@example.com"]);

    let none = db
        .select("users")
        .filter([("id", Vec::<i64>::new())])
        .list()
        .await
        .unwrap();
    assert!(none.is_empty());

    provider.close().await;
}

#[tokio::test]
async fn test_upsert_on_conflict() {
    let (provider, db) = setup_db().await;

    db.insert("users")
        .set([("email", "ada@example.com"), ("name", "Ada")])
        .run()
        .await
        .unwrap();
    db.insert("users")
        .set([("email", "ada@example.com"), ("name", "Countess")])
        .on_conflict(["email"], OnConflict::Update(vec!["name".to_string()]))
        .run()
        .await
        .unwrap();
    let skipped = db
        .insert("users")
        .set([("email", "ada@example.com"), ("name", "Ignored")])
        .on_conflict(["email"], OnConflict::DoNothing)
        .run()
        .await
        .unwrap();

    assert_eq!(skipped, 0);
    assert_eq!(user_count(&db).await, 1);
    let name: String = db
        .select("users")
        .map(|row| row.get("name"))
        .one()
        .await
        .unwrap();
    assert_eq!(name, "Countess");

    provider.close().await;
}

#[tokio::test]
async fn test_scope_commits_on_success() {
    let (provider, db) = setup_db().await;
    let scope = RequestTransactionScope::new(Arc::clone(db.provider()));

    scope
        .run(async {
            db.insert("users").set([("email", "a@example.com")]).run().await?;
            db.insert("users").set([("email", "b@example.com")]).run().await
        })
        .await
        .unwrap();

    assert_eq!(user_count(&db).await, 2);
    provider.close().await;
}

#[tokio::test]
async fn test_scope_rolls_back_on_error() {
    let (provider, db) = setup_db().await;
    let scope = RequestTransactionScope::new(Arc::clone(db.provider()));

    let result: Result<u64, DbError> = scope
        .run(async {
            db.insert("users").set([("email", "a@example.com")]).run().await?;
            // Unique violation on the second insert
            db.insert("users").set([("email", "a@example.com")]).run().await
        })
        .await;

    assert!(matches!(result, Err(DbError::Statement { .. })));
    assert_eq!(user_count(&db).await, 0);
    provider.close().await;
}

#[tokio::test]
async fn test_transaction_sees_its_own_writes() {
    let (provider, db) = setup_db().await;
    let tx = Transaction::open(Arc::clone(db.provider()));

    let inside = async {
        db.insert("users").set([("email", "a@example.com")]).run().await?;
        db.count("users", predicates![]).await
    }
    .in_transaction(&tx)
    .await
    .unwrap();
    assert_eq!(inside, 1);

    tx.close(false).await;
    assert_eq!(user_count(&db).await, 0);
    provider.close().await;
}

#[tokio::test]
async fn test_column_decoding() {
    let (provider, db) = setup_db().await;

    db.insert("users")
        .set(predicates![
            "email" => "ada@example.com",
            "name" => Option::<String>::None,
            "score" => 9.5_f64,
            "active" => false,
            "avatar" => SqlValue::Bytes(vec![1, 2, 3]),
        ])
        .run()
        .await
        .unwrap();

    let row = db.select("users").one().await.unwrap();
    assert_eq!(row.value("name").unwrap(), &SqlValue::Null);
    assert_eq!(row.get::<Option<String>>("name").unwrap(), None);
    assert_eq!(row.get::<f64>("score").unwrap(), 9.5);
    assert!(!row.get::<bool>("active").unwrap());
    assert_eq!(row.value("avatar").unwrap(), &SqlValue::Bytes(vec![1, 2, 3]));
    assert!(matches!(row.value("id").unwrap(), SqlValue::Int(_)));

    provider.close().await;
}

#[tokio::test]
async fn test_empty_result_reports_columns() {
    let (provider, _db) = setup_db().await;

    {
        let mut conn = provider.open_connection().await.unwrap();
        let mut cursor = conn.query("select * from users", &[]).await.unwrap();
        assert_eq!(
            cursor.columns(),
            ["id", "email", "name", "score", "active", "avatar"].map(String::from)
        );
        assert!(cursor.next().await.unwrap().is_none());
    }

    provider.close().await;
}

#[tokio::test]
async fn test_get_by_id() {
    let (provider, db) = setup_db().await;
    let id = GeneratedKey::<i64>::new();
    db.insert("users")
        .set(predicates!["id" => id.clone(), "email" => "ada@example.com"])
        .run()
        .await
        .unwrap();
    let id = id.value().unwrap();

    let row = db.get("users", id).await.unwrap();
    assert_eq!(row.get::<String>("email").unwrap(), "ada@example.com");

    let err = db.get("users", id + 1).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().ends_with(&format!("users:{} not found", id + 1)));

    provider.close().await;
}

#[tokio::test]
async fn test_statement_error_reports_driver_message() {
    let (provider, db) = setup_db().await;

    let err = db.select("missing_table").list().await.unwrap_err();
    match err {
        DbError::Statement { message, .. } => assert!(message.contains("missing_table")),
        other => panic!("unexpected error: {other}"),
    }

    provider.close().await;
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    let path = temp_db_path();
    let (provider, db) = setup_db_at(&path).await;
    db.insert("users").set([("email", "a@example.com")]).run().await.unwrap();
    provider.close().await;

    let (read_only, db) = connect(&format!("sqlite:{}?readonly=true", path)).await;

    assert_eq!(user_count(&db).await, 1);
    let err = db
        .insert("users")
        .set([("email", "b@example.com")])
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Statement { .. }));

    read_only.close().await;
}

#[tokio::test]
async fn test_postgres_round_trip() {
    let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
        eprintln!("Skipping test: TEST_POSTGRES_URL not set");
        return;
    };

    let (sqlx_provider, db) = connect(&url).await;
    let table = format!("txsql_test_{}", uuid::Uuid::new_v4().simple());

    db.exec(
        &format!(
            "create table {} (id bigserial primary key, tags text[], amount numeric, created timestamptz default now())",
            table
        ),
        &[],
    )
    .await
    .unwrap();

    let id = GeneratedKey::<i64>::new();
    db.insert(&table)
        .set(predicates![
            "id" => id.clone(),
            "tags" => vec!["a".to_string(), "b".to_string()],
            "amount" => rust_decimal::Decimal::new(1250, 2),
        ])
        .run()
        .await
        .unwrap();

    let row = db.select(&table).filter([("id", id.value().unwrap())]).one().await.unwrap();
    assert_eq!(row.get::<Vec<String>>("tags").unwrap(), vec!["a", "b"]);
    assert_eq!(
        row.get::<rust_decimal::Decimal>("amount").unwrap(),
        rust_decimal::Decimal::new(1250, 2)
    );
    assert!(matches!(row.value("created").unwrap(), SqlValue::TimestampTz(_)));

    // Plans cached before a schema change are retried inside the transaction
    let tx = Transaction::open(Arc::clone(db.provider()));
    let columns = async {
        db.select(&table).list().await?;
        db.exec(&format!("alter table {} add column note text", table), &[])
            .await?;
        let row = db.select(&table).one().await?;
        Ok::<_, DbError>(row.columns().len())
    }
    .in_transaction(&tx)
    .await
    .unwrap();
    assert_eq!(columns, 5);
    tx.close(false).await;

    db.exec(&format!("drop table {}", table), &[]).await.unwrap();
    sqlx_provider.close().await;
}

#[tokio::test]
async fn test_postgres_autosave_always_keeps_transaction_usable() {
    let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
        eprintln!("Skipping test: TEST_POSTGRES_URL not set");
        return;
    };
    let separator = if url.contains('?') { '&' } else { '?' };
    let (sqlx_provider, db) = connect(&format!("{}{}autosave=always", url, separator)).await;

    let tx = Transaction::open(Arc::clone(db.provider()));
    let after_failure = async {
        let failed = db.exec("select * from txsql_no_such_table", &[]).await;
        assert!(matches!(failed, Err(DbError::Statement { .. })));
        db.count("pg_class", predicates![]).await
    }
    .in_transaction(&tx)
    .await;
    assert!(after_failure.unwrap() > 0);
    tx.close(false).await;

    sqlx_provider.close().await;
}
