//! Tests for configuration loading and repository creation

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dynrepo::command::CommandOptions;
use dynrepo::config::{ConnectionStringResolver, RepositoryConfig};
use dynrepo::error::{Error, ErrorCategory, Result};
use dynrepo::filter::FilterRequest;
use dynrepo::params::Params;
use dynrepo::repository::RepositoryFactory;
use dynrepo::strategy::{NamingConvention, ParameterStrategy};
use dynrepo::testing::MockDatabase;
use dynrepo::types::{Row, Value};

const CONFIG: &str = r#"
retry:
  enabled: false
  max_retries: 7
command:
  timeout_secs: 5
  application_name: billing
pagination:
  max_page_size: 50
parameters:
  naming: pascal
  procedure_strategy: individual
connection_strings:
  billing: ${DYNREPO_CONFIG_TEST_URL:-postgres://localhost/billing}
  reports: "${DYNREPO_CONFIG_TEST_REPORTS}"
"#;

#[test]
fn test_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = RepositoryConfig::from_file(file.path()).unwrap();
    assert!(!config.retry.enabled);
    assert_eq!(config.retry.max_retries, 7);
    assert_eq!(config.command_timeout(), Duration::from_secs(5));
    assert_eq!(config.command.application_name.as_deref(), Some("billing"));
    assert_eq!(config.pagination.max_page_size, 50);
    assert_eq!(config.parameters.naming, Some(NamingConvention::Pascal));
    assert_eq!(config.parameters.procedure_strategy, ParameterStrategy::Individual);
    assert_eq!(
        config.connection_strings["billing"],
        "postgres://localhost/billing"
    );
    // unset variable without default expands to nothing
    assert_eq!(config.connection_strings["reports"], "");
}

#[test]
fn test_env_var_wins_over_default() {
    std::env::set_var("DYNREPO_CONFIG_TEST_SET_URL", "postgres://prod/billing");
    let config = RepositoryConfig::from_yaml_str(
        "connection_strings:\n  billing: ${DYNREPO_CONFIG_TEST_SET_URL:-postgres://localhost/billing}\n",
    )
    .unwrap();
    assert_eq!(config.connection_strings["billing"], "postgres://prod/billing");
}

#[test]
fn test_missing_file_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RepositoryConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_malformed_yaml() {
    let err = RepositoryConfig::from_yaml_str("retry: [not, a, map]").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[tokio::test]
async fn test_factory_applies_config() {
    let db = MockDatabase::new().with_rows(vec![Row::from_pairs([("id", 1)])]);
    let config = RepositoryConfig::from_yaml_str(CONFIG).unwrap();
    let factory = RepositoryFactory::from_config(Arc::new(db.factory()), config);

    let repo = factory.create("billing").unwrap();
    assert_eq!(repo.retry_policy().effective_retries(), 0);

    // pascal naming for filter parameters
    let _: Vec<Row> = repo
        .get_filtered(
            "SELECT * FROM invoices WHERE customer ILIKE @SearchTerm",
            &Params::new(),
            &FilterRequest::new().search("acme"),
            &CommandOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(db.statements()[0].params, vec![Value::from("%acme%")]);

    // retries disabled: a transient failure surfaces immediately
    db.fail_next(Error::timeout("statement timeout"));
    let err = repo
        .query::<Row>("SELECT 1", &Params::new(), &CommandOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert_eq!(db.statements().len(), 2);

    let err = factory.create("reports").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

struct CountingResolver {
    calls: AtomicUsize,
}

impl ConnectionStringResolver for CountingResolver {
    fn resolve(&self, name: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("postgres://vault/{}", name))
    }
}

#[test]
fn test_factory_resolves_each_name_once() {
    let db = MockDatabase::new();
    let resolver = Arc::new(CountingResolver {
        calls: AtomicUsize::new(0),
    });
    let factory = RepositoryFactory::new(
        Arc::new(db.factory()),
        resolver.clone(),
        RepositoryConfig::default(),
    );

    for _ in 0..3 {
        factory.create("ledger").unwrap();
    }
    factory.create("audit").unwrap();

    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        factory.connection_string("ledger").unwrap(),
        "postgres://vault/ledger"
    );
}
