use std::sync::Arc;

/// The storage authority. Cheap to clone; every clone shares the pool, the
/// clock and the certificate counting strategy.
#[derive(Clone)]
pub struct StorageAuthority {
    pub(crate) db: crate::DBPool,
    pub(crate) clock: Arc<dyn crate::clock::Clock>,
    pub(crate) cert_counter: Arc<dyn crate::rate_limits::CertificateCounter>,
    pub(crate) options: crate::settings::SaOptions,
}

impl StorageAuthority {
    pub fn new(db: crate::DBPool, options: crate::settings::SaOptions) -> crate::Result<Self> {
        if options.parallelism_per_rpc < 1 {
            return Err(crate::Error::invalid("parallelism per RPC must be at least 1"));
        }
        let cert_counter = Arc::new(crate::rate_limits::IssuedNameCounter::new(db.clone()));
        Ok(StorageAuthority {
            db,
            clock: Arc::new(crate::clock::SystemClock),
            cert_counter,
            options,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn crate::clock::Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the per-name certificate counting strategy used by
    /// `count_certificates_by_names`.
    pub fn with_cert_counter(mut self, counter: Arc<dyn crate::rate_limits::CertificateCounter>) -> Self {
        self.cert_counter = counter;
        self
    }

    pub fn options(&self) -> crate::settings::SaOptions {
        self.options
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) async fn get_db_conn(&self) -> crate::Result<crate::DBConn> {
        get_db_conn(&self.db).await
    }

    /// Checks a pooled connection can be obtained.
    pub async fn ping(&self) -> crate::Result<()> {
        self.get_db_conn().await.map(|_| ())
    }
}

pub(crate) async fn get_db_conn(db: &crate::DBPool) -> crate::Result<crate::DBConn> {
    match db.get().await {
        Ok(c) => Ok(c),
        Err(e) => {
            warn!("Failed to get DB connection: {}", e);
            Err(crate::Error::Storage(format!("failed to get DB connection: {}", e)))
        }
    }
}
