use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::WorkflowService;
use weft_core::types::{
    InstanceRecord, PhaseRecord, RunStatus, SubWorkflowHandle, SubWorkflowRequest,
};
use weft_core::WorkflowDefinition;

/// [`WorkflowService`] kept entirely in memory, with accessors for asserting
/// on what the engine reported.
#[derive(Default)]
pub struct InMemoryWorkflowService {
    definitions: Mutex<HashMap<String, Vec<WorkflowDefinition>>>,
    instances: Mutex<HashMap<String, InstanceRecord>>,
    phases: Mutex<Vec<PhaseRecord>>,
    statuses: Mutex<Vec<(String, RunStatus)>>,
    locked: Mutex<BTreeSet<(String, u32)>>,
    sub_requests: Mutex<Vec<SubWorkflowRequest>>,
}

impl InMemoryWorkflowService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(self, definition: WorkflowDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .lock()
            .unwrap()
            .entry(definition.id.clone())
            .or_default()
            .push(definition);
    }

    pub fn phases(&self) -> Vec<PhaseRecord> {
        self.phases.lock().unwrap().clone()
    }

    /// Statuses persisted for one instance, in order.
    pub fn status_history(&self, instance_id: &str) -> Vec<RunStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.instances.lock().unwrap().get(instance_id).cloned()
    }

    pub fn sub_requests(&self) -> Vec<SubWorkflowRequest> {
        self.sub_requests.lock().unwrap().clone()
    }

    pub fn is_locked(&self, workflow_id: &str, version: u32) -> bool {
        self.locked
            .lock()
            .unwrap()
            .contains(&(workflow_id.to_string(), version))
    }

    fn find(&self, workflow_id: &str, version: Option<u32>) -> Option<WorkflowDefinition> {
        let definitions = self.definitions.lock().unwrap();
        let versions = definitions.get(workflow_id)?;
        match version {
            Some(v) => versions.iter().find(|d| d.version == v).cloned(),
            None => versions.iter().max_by_key(|d| d.version).cloned(),
        }
    }

    fn new_instance(
        &self,
        definition: &WorkflowDefinition,
        project_folder: &str,
        parent_instance_id: Option<&str>,
    ) -> InstanceRecord {
        let record = InstanceRecord {
            instance_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            version: definition.version,
            status: RunStatus::Pending,
            project_folder: project_folder.to_string(),
            parent_instance_id: parent_instance_id.map(String::from),
            created_at: Utc::now(),
        };
        self.instances
            .lock()
            .unwrap()
            .insert(record.instance_id.clone(), record.clone());
        record
    }
}

impl WorkflowService for InMemoryWorkflowService {
    fn get_definition(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self.find(workflow_id, version);
        Box::pin(async move { Ok(found) })
    }

    fn create_instance(
        &self,
        definition: &WorkflowDefinition,
        project_folder: &str,
        parent_instance_id: Option<&str>,
    ) -> BoxFuture<'_, Result<InstanceRecord>> {
        let record = self.new_instance(definition, project_folder, parent_instance_id);
        Box::pin(async move { Ok(record) })
    }

    fn lock_version(&self, workflow_id: &str, version: u32) -> BoxFuture<'_, Result<()>> {
        self.locked
            .lock()
            .unwrap()
            .insert((workflow_id.to_string(), version));
        Box::pin(async { Ok(()) })
    }

    fn record_phase_execution(&self, record: PhaseRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.phases.lock().unwrap().push(record);
            Ok(())
        })
    }

    fn update_instance_status(
        &self,
        instance_id: &str,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<()>> {
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            if let Some(record) = self.instances.lock().unwrap().get_mut(&instance_id) {
                record.status = status;
            }
            self.statuses.lock().unwrap().push((instance_id, status));
            Ok(())
        })
    }

    fn start_sub_workflow(
        &self,
        request: SubWorkflowRequest,
    ) -> BoxFuture<'_, Result<SubWorkflowHandle>> {
        Box::pin(async move {
            let definition = self
                .find(&request.workflow_id, request.version)
                .ok_or_else(|| WeftError::WorkflowNotFound(request.workflow_id.clone()))?;
            self.lock_version(&definition.id, definition.version).await?;
            let record = self.new_instance(
                &definition,
                &request.project_folder,
                Some(&request.parent_instance_id),
            );
            self.sub_requests.lock().unwrap().push(request);
            Ok(SubWorkflowHandle {
                instance_id: record.instance_id,
                workflow_id: record.workflow_id,
                version: record.version,
                status: record.status,
            })
        })
    }
}
