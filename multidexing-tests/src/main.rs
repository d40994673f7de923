use multidexing::{PostgresRepo, Repo};
use multidexing_tests::{db, init_tracing};

#[tokio::main]
async fn main() {
    init_tracing();

    let Some(database_url) = db::database_url() else {
        eprintln!("TEST_DATABASE_URL is not set. See: sample.env");
        return;
    };

    db::setup(&database_url).await;
    let repo = PostgresRepo::new(&database_url).await.unwrap();
    repo.migrate().await.unwrap();
}
