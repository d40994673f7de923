use std::env;

use dotenvy::dotenv;
use tokio_postgres::NoTls;

/// `None` when Postgres tests should be skipped
pub fn database_url() -> Option<String> {
    dotenv().ok();

    env::var("TEST_DATABASE_URL").ok()
}

/// Creates the test database when it does not exist yet
pub async fn setup(database_url: &str) {
    if tokio_postgres::connect(database_url, NoTls).await.is_ok() {
        return;
    }

    let (db_name, db_raw_url) = get_db_name_and_raw_url(database_url);
    let (client, connection) = tokio_postgres::connect(&format!("{db_raw_url}/postgres"), NoTls)
        .await
        .unwrap_or_else(|_| panic!("Error connecting to {db_raw_url}"));
    tokio::spawn(connection);

    client
        .batch_execute(&format!(r#"CREATE DATABASE "{db_name}""#))
        .await
        .unwrap();
}

fn get_db_name_and_raw_url(url: &str) -> (String, String) {
    let mut url_split = url.split('/').collect::<Vec<&str>>();

    let db_name = url_split
        .pop()
        .expect("DATABASE NAME needs to be specified. See: sample.env");
    let db_raw_url = url_split.join("/");

    (db_name.to_string(), db_raw_url)
}
