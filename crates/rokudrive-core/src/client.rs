//! Request correlation and the typed client for the on-device component.
//!
//! [`DeviceClient`] is the explicit context object for one device: construct
//! it once per test run, share it by reference, and call
//! [`shutdown`](DeviceClient::shutdown) at the end.
//!
//! Every operation becomes a tracked exchange: a fresh request id, a pending
//! record registered before the frame is written, and a timeout racing the
//! response. Responses are matched by id, never by arrival order, so any
//! number of requests may be in flight on the shared socket.
//!
//! # Example
//!
//! ```no_run
//! use rokudrive_core::client::DeviceClient;
//! use rokudrive_core::config::DeviceConfig;
//! use rokudrive_core::request::BaseType;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DeviceClient::new(DeviceConfig::new("192.168.1.20"))?;
//!
//! let title = client.get_value(BaseType::Scene, "title.text").await?;
//! println!("title: {}", title.value);
//!
//! let nodes = client.store_node_references(false).await?;
//! println!("{} nodes on screen", nodes.tree.len());
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, debug_span, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::{DeviceConfig, LogLevel, DEFAULT_TIMEOUT};
use crate::connection::{ConnectionManager, Connector, TcpConnector};
use crate::error::RpcError;
use crate::node_tree::NodeTree;
use crate::pending::PendingRequests;
use crate::protocol::{encode_request, DeviceResponse, RequestSettings};
use crate::registry::RegistrySnapshot;
use crate::request::{
    BaseType, CallFuncResult, FieldChangeResult, FieldMatch, FocusedNodeResult,
    GetValuesResult, HasFocusResult, InFocusChainResult, ListResult, NodeCountResult, NodePath,
    PathStat, RegistryResult, RegistryValues, Request, ServerHostResult, StartTimeResult,
    StoreNodeReferencesFields, ValueResult,
};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-request overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the device and global default timeouts. Still scaled by the
    /// device's timeout multiplier.
    pub timeout: Option<Duration>,
    /// Source location reported in timeout errors.
    pub call_site: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Record the caller's source location for timeout messages.
    #[track_caller]
    pub fn located(mut self) -> Self {
        self.call_site = Some(Location::caller().to_string());
        self
    }
}

/// Reconstructed scene graph returned by
/// [`store_node_references`](DeviceClient::store_node_references).
#[derive(Debug, Clone)]
pub struct StoredNodes {
    pub tree: NodeTree,
    pub total_nodes: Option<u64>,
    pub node_count_by_type: Option<BTreeMap<String, u64>>,
}

fn parse<T: DeserializeOwned>(
    response: &DeviceResponse,
    request_type: &'static str,
) -> Result<T, RpcError> {
    response
        .parse()
        .map_err(|source| RpcError::UnexpectedResponse {
            request_type,
            source,
        })
}

// ---------------------------------------------------------------------------
// DeviceClient
// ---------------------------------------------------------------------------

/// Client for one device's on-device component.
pub struct DeviceClient {
    config: DeviceConfig,
    connections: ConnectionManager,
    pending: Arc<PendingRequests>,
    registry: RegistrySnapshot,
}

impl DeviceClient {
    /// Create a client that talks TCP to `config.host:config.port`.
    ///
    /// No connection is made until the first request.
    pub fn new(config: DeviceConfig) -> Result<Self, RpcError> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a client over a custom transport.
    pub fn with_connector(
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let pending = Arc::new(PendingRequests::new());
        let connections = ConnectionManager::new(
            config.host.clone(),
            config.port,
            config.reconnect_delay(),
            connector,
            pending.clone(),
        );
        Ok(Self {
            registry: RegistrySnapshot::new(config.restore_registry),
            config,
            connections,
            pending,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegistrySnapshot {
        &self.registry
    }

    pub async fn is_connected(&self) -> bool {
        self.connections.is_connected().await
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Effective timeout: explicit override, else device default, else global
    /// default, scaled by the device multiplier. Saturates at `Duration::MAX`.
    pub fn timeout_for(&self, options: &RequestOptions) -> Duration {
        let base = options
            .timeout
            .or_else(|| self.config.default_timeout())
            .unwrap_or(DEFAULT_TIMEOUT);
        Duration::try_from_secs_f64(base.as_secs_f64() * self.config.timeout_multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Send a request and wait for its response.
    ///
    /// Resolves with the full response on `success: true`, fails with
    /// [`RpcError::Device`] on `success: false` and with
    /// [`RpcError::Timeout`] if nothing arrives in time.
    pub async fn send(
        &self,
        request: &Request,
        options: &RequestOptions,
    ) -> Result<DeviceResponse, RpcError> {
        self.capture_registry().await?;
        self.dispatch(request, options).await
    }

    async fn capture_registry(&self) -> Result<(), RpcError> {
        if !self.registry.begin_capture() {
            return Ok(());
        }

        // Back to NotCaptured unless finished, including when this future is
        // dropped mid-capture.
        let _capture = self.registry.capture_guard();
        let request = Request::ReadRegistry {};
        let captured = self
            .dispatch(&request, &RequestOptions::default())
            .await
            .and_then(|response| parse::<RegistryResult>(&response, request.request_type()));

        match captured {
            Ok(result) => {
                info!(sections = result.values.len(), "captured device registry");
                self.registry.finish_capture(result.values);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(
        &self,
        request: &Request,
        options: &RequestOptions,
    ) -> Result<DeviceResponse, RpcError> {
        let request_type = request.request_type();
        let id = Uuid::new_v4().simple().to_string();
        let timeout = self.timeout_for(options);
        let span = debug_span!("device_send", request_type, request_id = %id);
        let frame = encode_request(
            &id,
            request,
            RequestSettings {
                log_level: self.config.log_level,
            },
        )?;
        let _pending = self.pending.abandon_on_drop(&id);

        async {
            let started = Instant::now();

            match tokio::time::timeout(timeout, self.exchange(&id, request_type, &frame)).await {
                Ok(Ok(response)) => {
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        binary_bytes = response.binary_payload.len(),
                        "response received"
                    );
                    Ok(response)
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "request failed");
                    Err(e)
                }
                Err(_) => {
                    // Abandoned by `_pending`, not cancelled: the device is not told.
                    warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
                    Err(RpcError::Timeout {
                        request_type,
                        timeout,
                        call_site: options.call_site.clone(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        id: &str,
        request_type: &'static str,
        frame: &[u8],
    ) -> Result<DeviceResponse, RpcError> {
        let connection = self.connections.ensure_connected().await?;
        let generation = connection.generation();

        let reply = self.pending.register(id.to_string(), request_type, generation);
        if connection.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        // The write runs to completion even if this request times out, so a
        // half-written frame never desynchronises the socket.
        let frame = frame.to_vec();
        let write = tokio::spawn(async move { connection.write_frame(&frame).await });
        let written = match write.await {
            Ok(result) => result,
            Err(join_err) => Err(RpcError::Io(std::io::Error::other(join_err))),
        };
        if let Err(e) = written {
            self.connections.discard(generation).await;
            return Err(e);
        }

        reply.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, RpcError> {
        let response = self.send(&request, &RequestOptions::default()).await?;
        parse(&response, request.request_type())
    }

    async fn call_unit(&self, request: Request) -> Result<(), RpcError> {
        self.send(&request, &RequestOptions::default()).await?;
        Ok(())
    }

    /// Restore the registry snapshot (if one was captured), then close the
    /// socket.
    ///
    /// The socket is closed even when the restore fails; the restore error is
    /// returned afterwards.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        let restored = match self.registry.take_for_restore() {
            Some(values) => {
                info!(sections = values.len(), "restoring device registry");
                self.dispatch(&Request::WriteRegistry { values }, &RequestOptions::default())
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };
        if let Err(e) = &restored {
            warn!(error = %e, "registry restore failed");
        }

        self.disconnect().await;
        restored
    }

    /// Close the socket without restoring anything.
    pub async fn disconnect(&self) {
        self.connections.close().await;
    }

    // -----------------------------------------------------------------------
    // Node access
    // -----------------------------------------------------------------------

    pub async fn get_value(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
    ) -> Result<ValueResult, RpcError> {
        self.call(Request::GetValue {
            base,
            key_path: key_path.into(),
        })
        .await
    }

    /// Fetch several values in one round trip; results are keyed like
    /// `requests`.
    pub async fn get_values(
        &self,
        requests: BTreeMap<String, NodePath>,
    ) -> Result<BTreeMap<String, ValueResult>, RpcError> {
        let result: GetValuesResult = self.call(Request::GetValues { requests }).await?;
        Ok(result.results)
    }

    pub async fn set_value(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
        value: Value,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::SetValue {
            base,
            key_path: key_path.into(),
            value,
        })
        .await
    }

    /// Invoke an interface function on a node and return its result.
    pub async fn call_func(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
        func_name: impl Into<String>,
        func_params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let result: CallFuncResult = self
            .call(Request::CallFunc {
                base,
                key_path: key_path.into(),
                func_name: func_name.into(),
                func_params,
            })
            .await?;
        Ok(result.value)
    }

    pub async fn get_focused_node(&self, include_ref: bool) -> Result<FocusedNodeResult, RpcError> {
        self.call(Request::GetFocusedNode { include_ref }).await
    }

    pub async fn has_focus(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
    ) -> Result<bool, RpcError> {
        let result: HasFocusResult = self
            .call(Request::HasFocus {
                base,
                key_path: key_path.into(),
            })
            .await?;
        Ok(result.has_focus)
    }

    pub async fn is_in_focus_chain(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
    ) -> Result<bool, RpcError> {
        let result: InFocusChainResult = self
            .call(Request::IsInFocusChain {
                base,
                key_path: key_path.into(),
            })
            .await?;
        Ok(result.is_in_focus_chain)
    }

    pub async fn focus_node(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
        on: bool,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::FocusNode {
            base,
            key_path: key_path.into(),
            on,
        })
        .await
    }

    /// Wait for a field to change, optionally until `expected` matches.
    ///
    /// Usually needs a longer timeout than the default, hence `options`.
    pub async fn on_field_change_once(
        &self,
        base: BaseType,
        key_path: impl Into<String>,
        expected: Option<FieldMatch>,
        options: &RequestOptions,
    ) -> Result<Value, RpcError> {
        let request = Request::OnFieldChangeOnce {
            base,
            key_path: key_path.into(),
            expected,
        };
        let response = self.send(&request, options).await?;
        let result: FieldChangeResult = parse(&response, request.request_type())?;
        Ok(result.value)
    }

    // -----------------------------------------------------------------------
    // Scene graph
    // -----------------------------------------------------------------------

    /// Store references to every node on the device and rebuild the scene
    /// graph from the returned flat listing.
    #[instrument(skip(self), level = "debug")]
    pub async fn store_node_references(
        &self,
        include_array_grid_children: bool,
    ) -> Result<StoredNodes, RpcError> {
        let fields: StoreNodeReferencesFields = self
            .call(Request::StoreNodeReferences {
                include_node_count_info: true,
                include_array_grid_children,
            })
            .await?;
        let tree = NodeTree::build(fields.flat_tree)?;
        debug!(nodes = tree.len(), roots = tree.roots().count(), "scene graph rebuilt");
        Ok(StoredNodes {
            tree,
            total_nodes: fields.total_nodes,
            node_count_by_type: fields.node_count_by_type,
        })
    }

    pub async fn delete_node_references(&self) -> Result<(), RpcError> {
        self.call_unit(Request::DeleteNodeReferences {}).await
    }

    pub async fn get_all_count(&self) -> Result<NodeCountResult, RpcError> {
        self.call(Request::GetAllCount {}).await
    }

    pub async fn get_roots_count(&self) -> Result<NodeCountResult, RpcError> {
        self.call(Request::GetRootsCount {}).await
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    pub async fn read_registry(&self) -> Result<RegistryValues, RpcError> {
        let result: RegistryResult = self.call(Request::ReadRegistry {}).await?;
        Ok(result.values)
    }

    /// Write registry values; a `null` value deletes its key.
    pub async fn write_registry(&self, values: RegistryValues) -> Result<(), RpcError> {
        self.call_unit(Request::WriteRegistry { values }).await
    }

    pub async fn delete_registry_sections(
        &self,
        sections: Vec<String>,
        allow_entire_registry_delete: bool,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::DeleteRegistrySections {
            sections,
            allow_entire_registry_delete,
        })
        .await
    }

    pub async fn delete_entire_registry(&self) -> Result<(), RpcError> {
        self.call_unit(Request::DeleteEntireRegistry {}).await
    }

    // -----------------------------------------------------------------------
    // File system
    // -----------------------------------------------------------------------

    /// Read a device file; its contents arrive in the binary segment.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, RpcError> {
        let response = self
            .send(
                &Request::ReadFile {
                    path: path.to_string(),
                },
                &RequestOptions::default(),
            )
            .await?;
        Ok(response.binary_payload)
    }

    #[instrument(skip(self, contents), level = "debug", fields(bytes = contents.len()))]
    pub async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<(), RpcError> {
        self.call_unit(Request::WriteFile {
            path: path.to_string(),
            binary_payload: contents,
        })
        .await
    }

    pub async fn get_directory_listing(&self, path: &str) -> Result<Vec<String>, RpcError> {
        let result: ListResult = self
            .call(Request::GetDirectoryListing {
                path: path.to_string(),
            })
            .await?;
        Ok(result.list)
    }

    pub async fn stat_path(&self, path: &str) -> Result<PathStat, RpcError> {
        self.call(Request::StatPath {
            path: path.to_string(),
        })
        .await
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), RpcError> {
        self.call_unit(Request::CreateDirectory {
            path: path.to_string(),
        })
        .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), RpcError> {
        self.call_unit(Request::DeleteFile {
            path: path.to_string(),
        })
        .await
    }

    pub async fn rename_file(&self, from_path: &str, to_path: &str) -> Result<(), RpcError> {
        self.call_unit(Request::RenameFile {
            from_path: from_path.to_string(),
            to_path: to_path.to_string(),
        })
        .await
    }

    pub async fn get_volume_list(&self) -> Result<Vec<String>, RpcError> {
        let result: ListResult = self.call(Request::GetVolumeList {}).await?;
        Ok(result.list)
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    /// Milliseconds since the epoch at which the channel started.
    pub async fn get_application_start_time(&self) -> Result<u64, RpcError> {
        let result: StartTimeResult = self.call(Request::GetApplicationStartTime {}).await?;
        Ok(result.start_time)
    }

    /// Host address the device uses to reach this machine.
    pub async fn get_server_host(&self) -> Result<String, RpcError> {
        let result: ServerHostResult = self.call(Request::GetServerHost {}).await?;
        Ok(result.host)
    }

    pub async fn disable_screen_saver(&self, disable: bool) -> Result<(), RpcError> {
        self.call_unit(Request::DisableScreenSaver { disable }).await
    }

    /// Change the device component's own log level for subsequent work.
    pub async fn set_settings(&self, log_level: LogLevel) -> Result<(), RpcError> {
        self.call_unit(Request::SetSettings { log_level }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: DeviceConfig) -> DeviceClient {
        DeviceClient::new(config).unwrap()
    }

    #[test]
    fn new_creates_disconnected_client() {
        let client = client(DeviceConfig::new("127.0.0.1"));
        assert_eq!(client.in_flight(), 0);
        assert!(!client.registry().is_enabled());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DeviceConfig::new("roku");
        config.timeout_multiplier = 0.0;
        assert!(matches!(
            DeviceClient::new(config),
            Err(RpcError::Config(_))
        ));
    }

    #[test]
    fn timeout_falls_back_to_global_default() {
        let client = client(DeviceConfig::new("roku"));
        assert_eq!(client.timeout_for(&RequestOptions::new()), DEFAULT_TIMEOUT);
    }

    #[test]
    fn device_default_beats_global_default() {
        let mut config = DeviceConfig::new("roku");
        config.default_timeout_ms = Some(3000);
        let client = client(config);
        assert_eq!(
            client.timeout_for(&RequestOptions::new()),
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn explicit_timeout_beats_everything_and_is_scaled() {
        let mut config = DeviceConfig::new("roku");
        config.default_timeout_ms = Some(3000);
        config.timeout_multiplier = 2.5;
        let client = client(config);
        let options = RequestOptions::new().with_timeout(Duration::from_millis(200));
        assert_eq!(client.timeout_for(&options), Duration::from_millis(500));
    }

    #[test]
    fn huge_scaled_timeout_saturates() {
        let mut config = DeviceConfig::new("roku");
        config.default_timeout_ms = Some(u64::MAX);
        config.timeout_multiplier = 1e6;
        let client = client(config);
        assert_eq!(client.timeout_for(&RequestOptions::new()), Duration::MAX);
    }

    #[test]
    fn located_records_this_file() {
        let options = RequestOptions::new().located();
        let call_site = options.call_site.unwrap();
        assert!(call_site.contains("client.rs"), "got {call_site}");
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_harmless() {
        let client = client(DeviceConfig::new("127.0.0.1"));
        client.disconnect().await;
        assert!(!client.is_connected().await);
        client.shutdown().await.unwrap();
    }
}
