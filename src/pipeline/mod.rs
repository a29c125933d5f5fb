//! Per-request module pipelines.
//!
//! The [`PipelineResolver`] turns a tenant's enabled modules and a request into
//! an ordered list of [`ModuleInstance`]s. Resolution is synchronous and pure;
//! invoking the stages is the caller's business, driven through a
//! [`PipelineCursor`] that honors the stop signal.

pub mod resolver;

use std::{collections::BTreeMap, sync::Arc};

use http::HeaderMap;
use serde::Serialize;

use crate::module::{ModuleDescriptor, RoutingRule};

pub use resolver::{PipelineResolver, ResolverOptions};

/// Module id → permissions granted to that module for this request.
pub type ModulePermissions = BTreeMap<String, Vec<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Filter,
    Handler,
}

/// One resolved module invocation, owned by the request being processed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInstance {
    #[serde(skip)]
    pub module: Arc<ModuleDescriptor>,
    pub module_id: String,
    pub rule: RoutingRule,
    pub kind: StageKind,
    /// Path sent to the module, after any rewrite.
    pub path: String,
    pub method: Option<String>,
    pub headers_only: bool,
}

impl ModuleInstance {
    pub fn is_handler(&self) -> bool {
        self.kind == StageKind::Handler
    }
}

/// Ordered invocation plan for a single request.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    stages: Vec<ModuleInstance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    redirects: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    module_permissions: ModulePermissions,
}

impl Pipeline {
    pub(crate) fn new(
        stages: Vec<ModuleInstance>,
        redirects: Vec<String>,
        module_permissions: ModulePermissions,
    ) -> Self {
        Self {
            stages,
            redirects,
            module_permissions,
        }
    }

    pub fn stages(&self) -> &[ModuleInstance] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Redirect targets followed while resolving, in order.
    pub fn redirects(&self) -> &[String] {
        &self.redirects
    }

    pub fn module_permissions(&self) -> &ModulePermissions {
        &self.module_permissions
    }

    /// JSON value for the module-permissions header sent to the modules.
    pub fn module_permissions_header(&self) -> String {
        serde_json::to_string(&self.module_permissions).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn cursor(&self) -> PipelineCursor<'_> {
        PipelineCursor {
            stages: &self.stages,
            pos: 0,
            stopped: false,
        }
    }
}

/// Walks the stages of a pipeline. Once stopped, the remaining stages are skipped.
pub struct PipelineCursor<'a> {
    stages: &'a [ModuleInstance],
    pos: usize,
    stopped: bool,
}

impl<'a> PipelineCursor<'a> {
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stops when `headers` of the last module response carry `stop_header`.
    pub fn observe(&mut self, headers: &HeaderMap, stop_header: &str) {
        if headers.contains_key(stop_header) {
            log::debug!("Pipeline stopped after stage {}", self.pos);
            self.stop();
        }
    }

    /// Stages that were never handed out.
    pub fn skipped(&self) -> &'a [ModuleInstance] {
        &self.stages[self.pos..]
    }
}

impl<'a> Iterator for PipelineCursor<'a> {
    type Item = &'a ModuleInstance;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        let stage = self.stages.get(self.pos)?;
        self.pos += 1;
        Some(stage)
    }
}
