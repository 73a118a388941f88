#[macro_use]
extern crate rocket;

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod request_logger;
pub mod routes;
pub mod store;
pub mod transfer;

use crate::config::TransferConfig;
use crate::db::VaultDb;
use crate::request_logger::RequestLogger;
use crate::store::PgVaultStore;
use crate::transfer::store::SharedStore;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let transfer_config = TransferConfig::from_env();
    log::info!(
        "transfer config: batch size {}, batch pause {:?}, upload limit {} bytes",
        transfer_config.batch_size,
        transfer_config.batch_pause,
        transfer_config.max_upload_bytes
    );

    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(VaultDb::init())
        .attach(cors)
        .manage(transfer_config)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match VaultDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match store::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Hand the pool to the transfer pipeline behind the store trait
        .attach(AdHoc::try_on_ignite(
            "Manage Vault Store",
            |rocket| async move {
                match VaultDb::fetch(&rocket) {
                    Some(db) => {
                        let store: SharedStore = Arc::new(PgVaultStore::new((**db).clone()));
                        Ok(rocket.manage(store))
                    }
                    None => {
                        log::error!("database pool not available for vault store");
                        Err(rocket)
                    }
                }
            },
        ))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                // Transfer routes
                routes::transfer::export_snapshot,
                routes::transfer::import_snapshot,
                routes::transfer::stage_import,
                routes::transfer::apply_pending_import,
                routes::transfer::transfer_status,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Chat Vault API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::TransferConfig;
    use crate::transfer::store::SharedStore;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};

    pub use database::{TestDatabase, TestDatabaseError};
    pub use memory::MemoryStore;

    pub mod memory {
        use crate::models::{
            Character, CharacterGroup, ChatMessage, ChatSession, MessageVersion, Persona,
            Setting, StoredDataset, UserPrompt, nest_sessions,
        };
        use crate::transfer::entity::EntityKind;
        use crate::transfer::natural_key::NaturalKey;
        use crate::transfer::snapshot::Snapshot;
        use crate::transfer::store::{
            NewRecord, RecordCounts, StoreError, StoreResult, VaultStore, WriteOutcome,
        };
        use chrono::{DateTime, Utc};
        use parking_lot::Mutex;
        use std::collections::{HashMap, HashSet};
        use uuid::Uuid;

        /// Target ids start well away from typical exported ids so that a
        /// leaked exported id shows up as a dangling reference.
        const FIRST_ID: i32 = 1001;

        #[derive(Default)]
        struct MemoryState {
            next_id: i32,
            keys: HashMap<NaturalKey, i32>,
            groups: Vec<CharacterGroup>,
            personas: Vec<Persona>,
            characters: Vec<Character>,
            prompts: Vec<UserPrompt>,
            settings: Vec<Setting>,
            sessions: Vec<ChatSession>,
            messages: Vec<ChatMessage>,
            versions: Vec<MessageVersion>,
            pending: HashMap<Uuid, (Snapshot, DateTime<Utc>)>,
            failing_keys: HashSet<NaturalKey>,
            offline: bool,
            create_calls: usize,
        }

        impl MemoryState {
            fn store(&mut self, record: &NewRecord) -> i32 {
                self.next_id = self.next_id.max(FIRST_ID);
                let id = self.next_id;
                self.next_id += 1;
                let now = Some(Utc::now());

                match record.clone() {
                    NewRecord::CharacterGroup(group) => self.groups.push(CharacterGroup {
                        id,
                        name: group.name,
                        color: group.color,
                        sort_order: group.sort_order,
                        created_at: now,
                    }),
                    NewRecord::Persona(persona) => self.personas.push(Persona {
                        id,
                        name: persona.name,
                        profile_name: persona.profile_name,
                        profile: persona.profile,
                        created_at: now,
                    }),
                    NewRecord::Character(character) => self.characters.push(Character {
                        id,
                        name: character.name,
                        profile_name: character.profile_name,
                        personality: character.personality,
                        scenario: character.scenario,
                        example_dialogue: character.example_dialogue,
                        first_message: character.first_message,
                        group_id: character.group_id,
                        created_at: now,
                    }),
                    NewRecord::UserPrompt(prompt) => self.prompts.push(UserPrompt {
                        id,
                        title: prompt.title,
                        body: prompt.body,
                        created_at: now,
                    }),
                    NewRecord::Setting(setting) => self.settings.push(Setting {
                        id,
                        key: setting.key,
                        value: setting.value,
                    }),
                    NewRecord::ChatSession(session) => self.sessions.push(ChatSession {
                        id,
                        persona_id: session.persona_id,
                        character_id: session.character_id,
                        created_at: session.created_at,
                        summary: session.summary,
                        notes: session.notes,
                    }),
                    NewRecord::ChatMessage(message) => self.messages.push(ChatMessage {
                        id,
                        session_id: message.session_id,
                        role: message.role,
                        content: message.content,
                        created_at: message.created_at,
                    }),
                    NewRecord::MessageVersion(version) => self.versions.push(MessageVersion {
                        id,
                        message_id: version.message_id,
                        version: version.version,
                        content: version.content,
                        is_active: version.is_active,
                    }),
                }

                self.keys.insert(record.natural_key(), id);
                id
            }

            fn count(&self, kind: EntityKind) -> usize {
                match kind {
                    EntityKind::CharacterGroup => self.groups.len(),
                    EntityKind::Persona => self.personas.len(),
                    EntityKind::Character => self.characters.len(),
                    EntityKind::UserPrompt => self.prompts.len(),
                    EntityKind::Setting => self.settings.len(),
                    EntityKind::ChatSession => self.sessions.len(),
                    EntityKind::ChatMessage => self.messages.len(),
                    EntityKind::MessageVersion => self.versions.len(),
                }
            }
        }

        /// In-process [`VaultStore`] with the same natural-key semantics as
        /// the PostgreSQL store, plus hooks for failure injection.
        #[derive(Default)]
        pub struct MemoryStore {
            state: Mutex<MemoryState>,
        }

        impl MemoryStore {
            pub fn new() -> Self {
                Self::default()
            }

            /// Write `record` directly, bypassing failure injection.
            pub fn seed(&self, record: NewRecord) -> i32 {
                let mut state = self.state.lock();
                if let Some(id) = state.keys.get(&record.natural_key()).copied() {
                    return id;
                }
                state.store(&record)
            }

            /// Make every create of `key` fail.
            pub fn fail_on(&self, key: NaturalKey) {
                self.state.lock().failing_keys.insert(key);
            }

            /// Toggle the connectivity probe.
            pub fn set_available(&self, available: bool) {
                self.state.lock().offline = !available;
            }

            pub fn count(&self, kind: EntityKind) -> usize {
                self.state.lock().count(kind)
            }

            /// Number of `create` calls received, including failed ones.
            pub fn create_calls(&self) -> usize {
                self.state.lock().create_calls
            }

            pub fn setting_value(&self, key: &str) -> Option<String> {
                self.state
                    .lock()
                    .settings
                    .iter()
                    .find(|setting| setting.key == key)
                    .map(|setting| setting.value.clone())
            }

            pub fn characters(&self) -> Vec<Character> {
                self.state.lock().characters.clone()
            }

            pub fn groups(&self) -> Vec<CharacterGroup> {
                self.state.lock().groups.clone()
            }

            pub fn sessions(&self) -> Vec<ChatSession> {
                self.state.lock().sessions.clone()
            }

            pub fn messages(&self) -> Vec<ChatMessage> {
                self.state.lock().messages.clone()
            }

            /// Describe every foreign key that points at no existing row.
            pub fn dangling_references(&self) -> Vec<String> {
                let state = self.state.lock();
                let ids = |ids: Vec<i32>| ids.into_iter().collect::<HashSet<i32>>();
                let groups = ids(state.groups.iter().map(|row| row.id).collect());
                let personas = ids(state.personas.iter().map(|row| row.id).collect());
                let characters = ids(state.characters.iter().map(|row| row.id).collect());
                let sessions = ids(state.sessions.iter().map(|row| row.id).collect());
                let messages = ids(state.messages.iter().map(|row| row.id).collect());

                let mut dangling = Vec::new();
                for character in &state.characters {
                    if let Some(group_id) = character.group_id {
                        if !groups.contains(&group_id) {
                            dangling.push(format!("character {} -> group {group_id}", character.id));
                        }
                    }
                }
                for session in &state.sessions {
                    if !personas.contains(&session.persona_id) {
                        dangling.push(format!(
                            "session {} -> persona {}",
                            session.id, session.persona_id
                        ));
                    }
                    if !characters.contains(&session.character_id) {
                        dangling.push(format!(
                            "session {} -> character {}",
                            session.id, session.character_id
                        ));
                    }
                }
                for message in &state.messages {
                    if !sessions.contains(&message.session_id) {
                        dangling.push(format!(
                            "message {} -> session {}",
                            message.id, message.session_id
                        ));
                    }
                }
                for version in &state.versions {
                    if !messages.contains(&version.message_id) {
                        dangling.push(format!(
                            "version {} -> message {}",
                            version.id, version.message_id
                        ));
                    }
                }
                dangling
            }
        }

        #[rocket::async_trait]
        impl VaultStore for MemoryStore {
            async fn ping(&self) -> StoreResult<()> {
                if self.state.lock().offline {
                    return Err(StoreError::Unavailable("memory store is offline".into()));
                }
                Ok(())
            }

            async fn find(&self, key: &NaturalKey) -> StoreResult<Option<i32>> {
                Ok(self.state.lock().keys.get(key).copied())
            }

            async fn create(&self, record: &NewRecord) -> StoreResult<WriteOutcome> {
                let mut state = self.state.lock();
                state.create_calls += 1;

                let key = record.natural_key();
                if state.failing_keys.contains(&key) {
                    return Err(StoreError::Unavailable(format!("injected failure for {key}")));
                }

                if let Some(id) = state.keys.get(&key).copied() {
                    return Ok(WriteOutcome::Existing(id));
                }
                Ok(WriteOutcome::Inserted(state.store(record)))
            }

            async fn load_dataset(&self) -> StoreResult<StoredDataset> {
                let state = self.state.lock();
                Ok(StoredDataset {
                    character_groups: state.groups.clone(),
                    personas: state.personas.clone(),
                    characters: state.characters.clone(),
                    user_prompts: state.prompts.clone(),
                    settings: state.settings.clone(),
                    sessions: nest_sessions(
                        state.sessions.clone(),
                        state.messages.clone(),
                        state.versions.clone(),
                    ),
                })
            }

            async fn record_counts(&self) -> StoreResult<RecordCounts> {
                let state = self.state.lock();
                Ok(EntityKind::STAGE_ORDER
                    .iter()
                    .map(|kind| (*kind, state.count(*kind) as i64))
                    .collect())
            }

            async fn save_pending_import(
                &self,
                token: Uuid,
                snapshot: &Snapshot,
                expires_at: DateTime<Utc>,
            ) -> StoreResult<()> {
                self.state
                    .lock()
                    .pending
                    .insert(token, (snapshot.clone(), expires_at));
                Ok(())
            }

            async fn take_pending_import(&self, token: Uuid) -> StoreResult<Option<Snapshot>> {
                let mut state = self.state.lock();
                let now = Utc::now();
                state.pending.retain(|_, (_, expires_at)| *expires_at > now);
                Ok(state.pending.remove(&token).map(|(snapshot, _)| snapshot))
            }
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("neither TEST_DATABASE_URL nor TEST_DATABASE_CONTAINER is set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        ///
        /// `TEST_DATABASE_URL` points at an existing server on which a fresh
        /// database is created; otherwise `TEST_DATABASE_CONTAINER=1` launches
        /// a disposable Postgres container. With neither set, tests skip.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::provision(&url, None).await;
                }

                if std::env::var("TEST_DATABASE_CONTAINER").is_ok() {
                    return Self::new_container().await;
                }

                Err(TestDatabaseError::MissingUrl)
            }

            /// Launch a disposable Postgres container and provision inside it.
            pub async fn new_container() -> Result<Self, TestDatabaseError> {
                // NULLS NOT DISTINCT needs Postgres 15 or newer.
                let image = GenericImage::new("postgres", "17-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ));

                let container = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres")
                    .start()
                    .await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                Self::provision(&admin_url, Some(container)).await
            }

            async fn provision(
                base_url: &str,
                container: Option<ContainerAsync<GenericImage>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions =
                    base_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options, &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ =
                                        drop_database_with_fallback(admin_options, &db_name).await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        store: Option<SharedStore>,
        transfer_config: Option<TransferConfig>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                ..Default::default()
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage the store used by transfer routes.
        pub fn manage_store(mut self, store: SharedStore) -> Self {
            self.store = Some(store);
            self
        }

        /// Override the transfer configuration (defaults otherwise).
        pub fn manage_transfer_config(mut self, config: TransferConfig) -> Self {
            self.transfer_config = Some(config);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment)
                .manage(self.transfer_config.unwrap_or_default());

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(store) = self.store {
                rocket = rocket.manage(store);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
