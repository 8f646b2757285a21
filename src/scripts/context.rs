//! Script execution context
//!
//! Everything a script learns about its invocation arrives through the
//! process environment built from an [`ExecutionContext`]. The child does not
//! inherit the parent's environment beyond [`INHERITED_ENV`].

use crate::autoreply::pattern::Bindings;
use crate::autoreply::tokens::TokenValues;
use crate::messages::NodeNum;
use serde::{Deserialize, Serialize};

/// Host variables passed through to scripts
pub const INHERITED_ENV: &[&str] = &["PATH", "TZ"];

/// Prefix for captured slot values
pub const PARAM_PREFIX: &str = "PARAM_";

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Inputs for a single script invocation
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    message: Option<String>,
    from_node: Option<NodeNum>,
    from_position: Option<Position>,
    local_position: Option<Position>,
    packet_id: Option<u32>,
    trigger: Option<String>,
    params: Bindings,
    mesh_ip: Option<String>,
    mesh_port: Option<u16>,
    node: Option<NodeNum>,
    geofence_name: Option<String>,
    geofence_event: Option<String>,
    node_count: Option<usize>,
}

impl ExecutionContext {
    /// Context for a script run in response to a mesh message
    pub fn for_message(message: impl Into<String>, from_node: NodeNum) -> Self {
        Self {
            message: Some(message.into()),
            from_node: Some(from_node),
            ..Self::default()
        }
    }

    /// Context for a timer or geofence invocation
    pub fn standalone() -> Self {
        Self::default()
    }

    pub fn with_packet_id(mut self, packet_id: u32) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_from_position(mut self, position: Option<Position>) -> Self {
        self.from_position = position;
        self
    }

    pub fn with_local_position(mut self, position: Option<Position>) -> Self {
        self.local_position = position;
        self
    }

    /// Record the matched pattern and its captured slots
    pub fn with_match(mut self, trigger: impl Into<String>, params: Bindings) -> Self {
        self.trigger = Some(trigger.into());
        self.params = params;
        self
    }

    pub fn with_mesh_endpoint(mut self, ip: Option<String>, port: Option<u16>) -> Self {
        self.mesh_ip = ip;
        self.mesh_port = port;
        self
    }

    /// Node the invocation concerns (geofence subject or timer target)
    pub fn with_node(mut self, node: NodeNum) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_geofence(mut self, name: impl Into<String>, event: impl Into<String>) -> Self {
        self.geofence_name = Some(name.into());
        self.geofence_event = Some(event.into());
        self
    }

    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = Some(count);
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn from_node(&self) -> Option<NodeNum> {
        self.from_node
    }

    pub fn params(&self) -> &Bindings {
        &self.params
    }

    /// Environment variables for the child process, in a stable order
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut put = |key: &str, value: String| env.push((key.to_string(), scrub(value)));

        if let Some(message) = &self.message {
            put("MESSAGE", message.clone());
        }
        if let Some(node) = self.from_node {
            put("FROM_NODE", node.0.to_string());
        }
        if let Some(pos) = self.from_position {
            put("FROM_LAT", pos.latitude.to_string());
            put("FROM_LON", pos.longitude.to_string());
        }
        if let Some(pos) = self.local_position {
            put("MM_LAT", pos.latitude.to_string());
            put("MM_LON", pos.longitude.to_string());
        }
        if let Some(id) = self.packet_id {
            put("PACKET_ID", id.to_string());
        }
        if let Some(trigger) = &self.trigger {
            put("TRIGGER", trigger.clone());
        }
        for (name, value) in self.params.iter() {
            put(&format!("{}{}", PARAM_PREFIX, name), value.to_string());
        }
        if let Some(ip) = &self.mesh_ip {
            put("MESHTASTIC_IP", ip.clone());
        }
        if let Some(port) = self.mesh_port {
            put("MESHTASTIC_PORT", port.to_string());
        }
        if let Some(node) = self.node {
            put("NODE_ID", node.node_id());
            put("NODE_NUM", node.0.to_string());
        }
        if let Some(name) = &self.geofence_name {
            put("GEOFENCE_NAME", name.clone());
        }
        if let Some(event) = &self.geofence_event {
            put("GEOFENCE_EVENT", event.clone());
        }

        env
    }

    /// Token values for argument and reply-text expansion
    pub fn token_values(&self) -> TokenValues {
        TokenValues {
            ip: self.mesh_ip.clone(),
            port: self.mesh_port,
            node_id: self.node.or(self.from_node).map(|n| n.node_id()),
            geofence_name: self.geofence_name.clone(),
            event: self.geofence_event.clone(),
            node_count: self.node_count,
            params: self.params.clone(),
            ..TokenValues::new()
        }
    }
}

/// Environment values cannot carry NUL bytes
fn scrub(value: String) -> String {
    if value.contains('\0') {
        value.replace('\0', "")
    } else {
        value
    }
}
