//! Request lifecycle.
//!
//! Every inbound request walks the same state machine:
//!
//! ```text
//! Received -> Routed -> Instantiated -> Executing -> Responded
//!     \          \            \             \
//!      +----------+------------+-------------+--> Errored
//! ```
//!
//! Routing and authentication happen before any guest code runs. A brand-new
//! instance is created for every request that gets past them, bound to a
//! fresh [`RequestContext`] and [`ResponseEnvelope`]; shared services are
//! injected by reference. Failures never escape as panics or errors: they
//! become a sealed JSON error envelope.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Instance, Store};

use crate::context::{AuthContext, RequestContext, ResponseEnvelope};
use crate::instance::InstanceRunner;
use crate::memory::{MEMORY_EXPORT, read_length_prefixed_text};
use crate::router::{RouteHandler, RouteTable};
use crate::services::HostServices;
use crate::store::{ExecutionMetrics, GuestState};
use crate::CompiledModule;
use guest_runtime_common::RuntimeError;

/// Lifecycle states of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Received,
    Routed,
    Instantiated,
    Executing,
    Responded,
    Errored,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a finished request produced.
#[derive(Debug)]
pub struct RequestOutcome {
    /// The sealed response envelope.
    pub response: ResponseEnvelope,
    /// `Responded` or `Errored`, plus the state the error happened in.
    pub state: LifecycleState,
    pub failed_in: Option<LifecycleState>,
    /// Metrics of the guest instance, if one was created.
    pub metrics: Option<ExecutionMetrics>,
}

/// Drives requests through the guest.
pub struct RequestLifecycle {
    runner: Arc<InstanceRunner>,
    module: CompiledModule,
    routes: Arc<RouteTable>,
    services: HostServices,
}

struct Failure {
    error: RuntimeError,
    state: LifecycleState,
    metrics: Option<ExecutionMetrics>,
}

impl Failure {
    fn at(state: LifecycleState, error: RuntimeError) -> Self {
        Self {
            error,
            state,
            metrics: None,
        }
    }
}

impl RequestLifecycle {
    /// Assemble a lifecycle around an already frozen route table.
    pub fn new(
        runner: Arc<InstanceRunner>,
        module: CompiledModule,
        routes: Arc<RouteTable>,
        services: HostServices,
    ) -> Self {
        Self {
            runner,
            module,
            routes,
            services,
        }
    }

    /// Run the guest's startup code and build a lifecycle from the routes it registers.
    ///
    /// # Errors
    ///
    /// Fails if the initialization entrypoint traps, times out or registers
    /// a malformed route.
    pub async fn bootstrap(
        runner: Arc<InstanceRunner>,
        module: CompiledModule,
        services: HostServices,
    ) -> Result<Self, RuntimeError> {
        let routes = runner.collect_routes(&module, services.clone()).await?;
        Ok(Self::new(runner, module, Arc::new(routes), services))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Serve one request.
    #[instrument(skip_all, fields(request_id = %request_id, method = %request.method, path = %request.path))]
    pub async fn handle(&self, request_id: &str, request: RequestContext) -> RequestOutcome {
        match self.run(request_id, request).await {
            Ok((response, metrics)) => {
                info!(
                    status = response.status(),
                    fuel_consumed = metrics.fuel_consumed,
                    instantiate_us = metrics.instantiate.map_or(0, |d| d.as_micros()),
                    execute_us = metrics.execute.map_or(0, |d| d.as_micros()),
                    "Request completed"
                );

                RequestOutcome {
                    response,
                    state: LifecycleState::Responded,
                    failed_in: None,
                    metrics: Some(metrics),
                }
            }
            Err(failure) => self.fail(failure),
        }
    }

    async fn run(
        &self,
        request_id: &str,
        mut request: RequestContext,
    ) -> Result<(ResponseEnvelope, ExecutionMetrics), Failure> {
        let Some(matched) = self.routes.find(&request.method, &request.path) else {
            return Err(Failure::at(
                LifecycleState::Received,
                RuntimeError::route_not_found(&request.method, &request.path),
            ));
        };
        let route = matched.handler;
        request.params = matched.params;
        debug!(handler_index = route.handler_index(), pattern = %route.pattern(), "Routed");

        if request.session_id.is_none() {
            request.session_id = request
                .cookie(&self.services.settings().session_cookie)
                .map(ToString::to_string);
        }
        request.auth = self
            .authenticate(&request, route)
            .map_err(|e| Failure::at(LifecycleState::Routed, e))?;

        let state = GuestState::for_request(request_id, request, self.services.clone());
        let mut store = self
            .runner
            .new_store(state)
            .map_err(|e| Failure::at(LifecycleState::Routed, e))?;

        let executed = tokio::time::timeout(
            self.runner.config().timeout(),
            self.execute(&mut store, route.handler_index()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Failure::at(
                LifecycleState::Executing,
                RuntimeError::ExecutionTimeout {
                    duration_ms: self.runner.config().timeout_ms,
                },
            ))
        });

        self.release_transactions(&mut store).await;
        store.data_mut().finalize_metrics();
        let metrics = store.data().metrics.clone();

        if let Err(mut failure) = executed {
            failure.metrics = Some(metrics);
            return Err(failure);
        }

        let mut response = std::mem::take(&mut store.data_mut().response);
        response.finalize();
        Ok((response, metrics))
    }

    /// Instantiate, call the handler and adopt its returned body.
    async fn execute(
        &self,
        store: &mut Store<GuestState>,
        handler_index: u32,
    ) -> Result<(), Failure> {
        let instance = self
            .runner
            .instantiate(&self.module, store)
            .await
            .map_err(|e| Failure::at(LifecycleState::Routed, e))?;
        debug!(state = %LifecycleState::Instantiated, "Executing handler");

        let returned = self
            .runner
            .call_handler(store, &instance, handler_index)
            .await
            .map_err(|e| Failure::at(LifecycleState::Executing, e))?;

        if let Some(ptr) = returned.filter(|ptr| *ptr != 0) {
            if !store.data().response.has_body() {
                let body = read_returned_body(store, &instance, ptr)
                    .map_err(|e| Failure::at(LifecycleState::Executing, e))?;
                // The envelope is not sealed before finalize.
                let _ = store.data_mut().response.set_body(body);
            }
        }

        Ok(())
    }

    /// Check the session against the route's requirements.
    ///
    /// Public routes still get an auth context when a valid session is sent.
    fn authenticate(
        &self,
        request: &RequestContext,
        route: &RouteHandler,
    ) -> Result<Option<AuthContext>, RuntimeError> {
        let auth = request.session_id.as_deref().and_then(|id| {
            self.services.sessions().get(id).map(|record| AuthContext {
                user_id: record.user_id,
                role: record.role,
                session_id: id.to_string(),
            })
        });

        if !route.is_protected() {
            return Ok(auth);
        }

        let auth = auth.ok_or(RuntimeError::AuthRequired)?;
        if let Some(required) = route.required_role() {
            if auth.role != required {
                return Err(RuntimeError::PermissionDenied {
                    required: required.to_string(),
                });
            }
        }

        Ok(Some(auth))
    }

    /// Roll back transactions the guest left open.
    async fn release_transactions(&self, store: &mut Store<GuestState>) {
        let open = std::mem::take(&mut store.data_mut().open_transactions);
        if open.is_empty() {
            return;
        }

        let Ok(database) = self.services.database() else {
            return;
        };

        for tx_id in open {
            warn!(tx_id = %tx_id, "Rolling back transaction left open by handler");
            if let Err(e) = database.rollback(&tx_id).await {
                warn!(tx_id = %tx_id, error = %e, "Rollback failed");
            }
        }
    }

    fn fail(&self, failure: Failure) -> RequestOutcome {
        let Failure {
            error: err,
            state,
            metrics,
        } = failure;

        if err.is_resource_limit() {
            warn!(error = %err, failed_in = %state, "Request terminated");
        } else if self.services.settings().verbose {
            error!(error = ?err, failed_in = %state, "Request failed");
        } else {
            debug!(error = ?err, failed_in = %state, "Request failed");
        }

        RequestOutcome {
            response: ResponseEnvelope::error(
                err.status_code(),
                err.error_code(),
                &err.public_message(),
            ),
            state: LifecycleState::Errored,
            failed_in: Some(state),
            metrics,
        }
    }
}

fn read_returned_body(
    store: &mut Store<GuestState>,
    instance: &Instance,
    ptr: i32,
) -> Result<String, RuntimeError> {
    let memory = instance
        .get_memory(&mut *store, MEMORY_EXPORT)
        .ok_or_else(|| RuntimeError::handler_fault("guest memory export missing"))?;

    read_length_prefixed_text(memory.data(&*store), ptr).map_err(|e| {
        RuntimeError::handler_fault(format!("failed to read handler response: {e}"))
    })
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("module", &self.module)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
