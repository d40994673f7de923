use std::future::Future;
use std::sync::OnceLock;

use multidexing::{PostgresRepo, Repo};
use tokio::sync::Mutex;

use crate::{db, init_tracing};

fn database_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    LOCK.get_or_init(|| Mutex::new(()))
}

/// Runs `test_fn` against a freshly reset Postgres repo, one test at a time.
/// Skipped when `TEST_DATABASE_URL` is not set.
pub async fn run_test<TestFn, Fut>(test_fn: TestFn)
where
    TestFn: FnOnce(PostgresRepo) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let Some(database_url) = db::database_url() else {
        return;
    };
    let _guard = database_lock().lock().await;

    db::setup(&database_url).await;
    let repo = PostgresRepo::new(&database_url).await.unwrap();
    repo.migrate().await.unwrap();
    repo.reset().await.unwrap();

    test_fn(repo).await;
}
