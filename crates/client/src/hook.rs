//! Fixture hooks.
//!
//! A hook populates a scratch database once per distinct parameter value;
//! the database is then frozen into a template that later requests clone.
//! Hooks run in the calling context and talk back to the broker through
//! their [`HookContext`].

use crate::connection::Connection;
use crate::context::TestDatabase;
use crate::error::{ClientError, ClientResult};
use crate::factory::{GetTestDatabaseOptions, TestDatabaseFactory, lazy_pool};
use cask_core::plain::to_plain_value;
use cask_core::{BrokerMessage, ClientMessage, ConnectionDetails, FrameId, HookOutcome};
use cask_runtime::ExecOutput;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;

/// A fixture hook.
///
/// Implemented for every `Fn(HookContext) -> impl Future<Output =
/// anyhow::Result<T>>` whose `T` serializes to plain data. The value is
/// handed back to every request served from the resulting template.
pub trait FixtureHook: Send + Sync + 'static {
    type Output: Serialize + Send + 'static;

    fn run(&self, ctx: HookContext) -> BoxFuture<'static, anyhow::Result<Self::Output>>;
}

impl<F, Fut, T> FixtureHook for F
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    type Output = T;

    fn run(&self, ctx: HookContext) -> BoxFuture<'static, anyhow::Result<T>> {
        self(ctx).boxed()
    }
}

/// A hook with its output already reduced to a wire outcome.
pub(crate) type BoxedHook = Arc<dyn Fn(HookContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;

pub(crate) fn boxed<H: FixtureHook>(hook: H) -> BoxedHook {
    let hook = Arc::new(hook);
    Arc::new(move |ctx: HookContext| {
        let run = hook.run(ctx);
        async move {
            match run.await {
                Ok(output) => match to_plain_value(&output) {
                    Ok(result) => HookOutcome::Ok { result },
                    Err(e) => HookOutcome::NonSerializable { message: e.message },
                },
                Err(e) => HookOutcome::Failed {
                    message: format!("{e:#}"),
                },
            }
        }
        .boxed()
    })
}

/// The broker exchange a hook runs inside.
#[derive(Clone)]
pub(crate) struct HookChannel {
    pub(crate) connection: Connection,
    pub(crate) run_hook: FrameId,
    pub(crate) factory: TestDatabaseFactory,
}

impl HookChannel {
    async fn call(&self, body: ClientMessage) -> ClientResult<BrokerMessage> {
        let mut exchange = self.connection.reply(self.run_hook, body)?;
        match exchange.next().await?.body {
            BrokerMessage::Error { error } => Err(ClientError::Broker(error)),
            body => Ok(body),
        }
    }
}

/// What a fixture hook gets to work with.
pub struct HookContext {
    /// The scratch database being populated.
    pub connection: ConnectionDetails,
    /// Lazily connecting pool on the scratch database; closed when the hook returns.
    pub pool: PgPool,
    /// Parameters of the request that triggered the build.
    pub params: Option<Value>,
    /// Nesting depth of the triggering request.
    pub depth: u32,
    pub(crate) channel: HookChannel,
}

impl HookContext {
    /// Deserialize the triggering request's parameters.
    pub fn params_as<T: DeserializeOwned>(&self) -> ClientResult<Option<T>> {
        self.params
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(ClientError::from)
    }

    /// Run a command inside the server's environment, e.g. `psql -f` on a
    /// bind-mounted script.
    pub async fn exec<I, S>(&self, command: I) -> ClientResult<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into_iter().map(Into::into).collect();
        match self
            .channel
            .call(ClientMessage::ExecInServer { command })
            .await?
        {
            BrokerMessage::ExecResult { exit_code, output } => Ok(ExecOutput { exit_code, output }),
            other => Err(unexpected(&other)),
        }
    }

    /// Start a template of its own, populated by hand and frozen with
    /// [`AdditionalTemplate::finish`]. Dropped by the broker if not finished
    /// before this hook returns.
    pub async fn build_additional_template(&self) -> ClientResult<AdditionalTemplate> {
        match self
            .channel
            .call(ClientMessage::BuildAdditionalTemplate)
            .await?
        {
            BrokerMessage::AdditionalTemplateStarted { connection } => {
                let pool = lazy_pool(
                    &connection.connection_string,
                    self.channel.factory.pool_max_connections(),
                )?;
                Ok(AdditionalTemplate {
                    connection,
                    pool,
                    channel: self.channel.clone(),
                })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Request another test database from inside this hook.
    ///
    /// Requests for the same parameters as the hook's own would wait on
    /// themselves; avoiding that recursion is up to the hook.
    pub async fn get_test_database<P: Serialize + ?Sized>(
        &self,
        params: Option<&P>,
        options: GetTestDatabaseOptions,
    ) -> ClientResult<TestDatabase> {
        let params = params.map(serde_json::to_value).transpose()?;
        self.channel
            .factory
            .request_database(
                &self.channel.connection,
                params,
                options.database_dedupe_key,
                self.depth + 1,
            )
            .await
    }
}

/// A template being built by hand inside a fixture hook.
pub struct AdditionalTemplate {
    pub connection: ConnectionDetails,
    pub pool: PgPool,
    channel: HookChannel,
}

impl AdditionalTemplate {
    /// Freeze the template and return its name for
    /// [`TestDatabaseFactory::from_template`].
    pub async fn finish(self) -> ClientResult<String> {
        self.pool.close().await;
        match self
            .channel
            .call(ClientMessage::FinishAdditionalTemplate {
                database: self.connection.database.clone(),
            })
            .await?
        {
            BrokerMessage::AdditionalTemplateFinished { template_name } => Ok(template_name),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(message: &BrokerMessage) -> ClientError {
    ClientError::Protocol(format!("unexpected {} from broker", message.name()))
}
