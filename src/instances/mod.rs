//! Instance actions served by a runner
//!
//! `ListInstances` pages through the store and marks which instances have a
//! live process. The other actions create and delete instances and drive
//! their processes through the [`ProcessManager`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Error;
use crate::db::InstanceStore;
use crate::process::{ProcessManager, StartOutcome, StopSignal};
use crate::protocol::{Action, Instance, InstanceId, NewInstance, PageQuery, PageResult};
use crate::server::{ActionHandler, ActionTable, HandlerError};

pub const ERROR_INVALID_PAGE: &str = "Invalid page parameters";
pub const ERROR_COUNT_FAILED: &str = "Failed to count instances";
pub const ERROR_FETCH_FAILED: &str = "Failed to fetch instances";
pub const ERROR_INVALID_INSTANCE: &str = "Invalid instance parameters";
pub const ERROR_CREATE_FAILED: &str = "Failed to create instance";
pub const ERROR_INVALID_ID: &str = "Invalid instance id";
pub const ERROR_NOT_FOUND: &str = "Instance not found";
pub const ERROR_START_FAILED: &str = "Failed to start instance";
pub const ERROR_NOT_RUNNING: &str = "Instance is not running";
pub const ERROR_STILL_RUNNING: &str = "Instance is running";
pub const ERROR_DELETE_FAILED: &str = "Failed to delete instance";

/// Shared state for the instance handlers
pub struct InstanceContext {
    store: Arc<dyn InstanceStore>,
    processes: ProcessManager,
    data_dir: PathBuf,
}

impl InstanceContext {
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        processes: ProcessManager,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            processes,
            data_dir: data_dir.into(),
        }
    }

    #[must_use]
    pub const fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Where the instance's process runs: its own setting, or `<data_dir>/instances/<id>`
    #[must_use]
    pub fn working_dir(&self, instance: &Instance) -> PathBuf {
        instance
            .working_directory
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .map_or_else(
                || default_working_dir(&self.data_dir, instance.id),
                PathBuf::from,
            )
    }

    fn find(&self, id: InstanceId) -> Result<Instance, HandlerError> {
        self.store
            .get(id)
            .map_err(|e| HandlerError::with_cause(ERROR_FETCH_FAILED, e))?
            .ok_or_else(|| HandlerError::new(ERROR_NOT_FOUND))
    }

    fn stop(&self, id: InstanceId, signal: StopSignal) -> Result<(), HandlerError> {
        if !self.processes.is_running(id) {
            return Err(HandlerError::new(ERROR_NOT_RUNNING));
        }
        self.processes
            .stop(id, signal)
            .map_err(|e| HandlerError::with_cause(ERROR_NOT_RUNNING, e))
    }
}

fn default_working_dir(data_dir: &Path, id: InstanceId) -> PathBuf {
    data_dir.join("instances").join(id.to_string())
}

/// Table with every instance action registered
#[must_use]
pub fn action_table(ctx: &Arc<InstanceContext>) -> ActionTable {
    let mut table = ActionTable::new();
    table
        .register(Action::ListInstances, ListInstances(Arc::clone(ctx)))
        .register(Action::AddInstance, AddInstance(Arc::clone(ctx)))
        .register(Action::StartInstance, StartInstance(Arc::clone(ctx)))
        .register(
            Action::StopInstance,
            StopInstance {
                ctx: Arc::clone(ctx),
                signal: StopSignal::Terminate,
            },
        )
        .register(
            Action::KillInstance,
            StopInstance {
                ctx: Arc::clone(ctx),
                signal: StopSignal::Kill,
            },
        )
        .register(Action::DeleteInstance, DeleteInstance(Arc::clone(ctx)));
    table
}

/// Paged instance listing
pub struct ListInstances(pub Arc<InstanceContext>);

#[async_trait]
impl ActionHandler for ListInstances {
    type Request = PageQuery;
    type Response = PageResult;
    const INVALID_PAYLOAD: &'static str = ERROR_INVALID_PAGE;

    fn decode(data: Value) -> Result<PageQuery, HandlerError> {
        match data {
            Value::Null => Ok(PageQuery::new(0, 0)),
            Value::Object(_) => serde_json::from_value(data)
                .map_err(|e| HandlerError::with_cause(ERROR_INVALID_PAGE, e)),
            other => Err(HandlerError::with_cause(
                ERROR_INVALID_PAGE,
                format!("expected an object, got {other}"),
            )),
        }
    }

    async fn handle(&self, query: PageQuery) -> Result<PageResult, HandlerError> {
        let query = query.normalized();
        let ctx = &self.0;

        let total = ctx
            .store
            .count()
            .map_err(|e| HandlerError::with_cause(ERROR_COUNT_FAILED, e))?;
        let mut items = ctx
            .store
            .find_page(query.offset(), query.page_size)
            .map_err(|e| HandlerError::with_cause(ERROR_FETCH_FAILED, e))?;

        for item in &mut items {
            item.is_running = ctx.processes.is_running(item.id);
        }

        tracing::debug!(page = query.page, page_size = query.page_size, total, "instances listed");
        Ok(PageResult { total, items })
    }
}

/// Instance creation
pub struct AddInstance(pub Arc<InstanceContext>);

#[async_trait]
impl ActionHandler for AddInstance {
    type Request = NewInstance;
    type Response = Instance;
    const INVALID_PAYLOAD: &'static str = ERROR_INVALID_INSTANCE;

    async fn handle(&self, new: NewInstance) -> Result<Instance, HandlerError> {
        new.validate()
            .map_err(|e| HandlerError::with_cause(ERROR_INVALID_INSTANCE, e))?;

        let instance = self
            .0
            .store
            .create(&new)
            .map_err(|e| HandlerError::with_cause(ERROR_CREATE_FAILED, e))?;

        tracing::info!(instance_id = instance.id, name = %instance.name, "instance added");
        Ok(instance)
    }
}

/// Launch an instance's process
pub struct StartInstance(pub Arc<InstanceContext>);

#[async_trait]
impl ActionHandler for StartInstance {
    type Request = InstanceId;
    type Response = ();
    const INVALID_PAYLOAD: &'static str = ERROR_INVALID_ID;

    async fn handle(&self, id: InstanceId) -> Result<(), HandlerError> {
        let ctx = &self.0;
        let instance = ctx.find(id)?;
        let working_dir = ctx.working_dir(&instance);

        match ctx
            .processes
            .start(id, &instance.launch_command, &working_dir)
        {
            Ok(StartOutcome::Started { .. }) => Ok(()),
            Ok(StartOutcome::AlreadyRunning) => {
                tracing::debug!(instance_id = id, "start ignored, already running");
                Ok(())
            }
            Err(e) => Err(HandlerError::with_cause(ERROR_START_FAILED, e)),
        }
    }
}

/// Stop (`Terminate`) or kill (`Kill`) an instance's process
pub struct StopInstance {
    pub ctx: Arc<InstanceContext>,
    pub signal: StopSignal,
}

#[async_trait]
impl ActionHandler for StopInstance {
    type Request = InstanceId;
    type Response = ();
    const INVALID_PAYLOAD: &'static str = ERROR_INVALID_ID;

    async fn handle(&self, id: InstanceId) -> Result<(), HandlerError> {
        self.ctx.find(id)?;
        self.ctx.stop(id, self.signal)
    }
}

/// Soft-delete an instance that has no live process
pub struct DeleteInstance(pub Arc<InstanceContext>);

#[async_trait]
impl ActionHandler for DeleteInstance {
    type Request = InstanceId;
    type Response = ();
    const INVALID_PAYLOAD: &'static str = ERROR_INVALID_ID;

    async fn handle(&self, id: InstanceId) -> Result<(), HandlerError> {
        let ctx = &self.0;
        if ctx.processes.is_running(id) {
            return Err(HandlerError::new(ERROR_STILL_RUNNING));
        }

        match ctx.store.delete(id) {
            Ok(()) => {
                tracing::info!(instance_id = id, "instance deleted");
                Ok(())
            }
            Err(Error::InstanceNotFound(_)) => Err(HandlerError::new(ERROR_NOT_FOUND)),
            Err(e) => Err(HandlerError::with_cause(ERROR_DELETE_FAILED, e)),
        }
    }
}
