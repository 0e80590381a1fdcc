//! Messages exchanged with the device-modding agent
//!
//! Each request produces any number of `Response::LogMsg` lines followed by a
//! single final response.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Query the install status of the app, the mod loader and installed mods
    GetModStatus {
        override_core_mod_url: Option<String>,
    },
    /// Patch the app with the mod loader
    Patch {
        downgrade_to: Option<String>,
        remodding: bool,
        allow_no_core_mods: bool,
        override_core_mod_url: Option<String>,
    },
    /// Import a file previously pushed to the device
    Import { from_path: String },
    /// Download and import a mod from a URL
    ImportModUrl { from_url: String },
    /// Remove an installed mod
    RemoveMod { id: String },
    /// Enable or disable mods by ID
    SetModsEnabled { statuses: HashMap<String, bool> },
}

impl Request {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetModStatus { .. } => "GetModStatus",
            Request::Patch { .. } => "Patch",
            Request::Import { .. } => "Import",
            Request::ImportModUrl { .. } => "ImportModUrl",
            Request::RemoveMod { .. } => "RemoveMod",
            Request::SetModsEnabled { .. } => "SetModsEnabled",
        }
    }
}

/// Severity of an agent log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// A response line from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Progress output, never final
    LogMsg { message: String, level: LogLevel },
    ModStatus(ModStatus),
    Patched {
        installed_mods: Vec<ModModel>,
        did_remove_dlc: bool,
    },
    Mods { installed_mods: Vec<ModModel> },
    ModSyncResult {
        installed_mods: Vec<ModModel>,
        failures: Option<String>,
    },
    ImportResult {
        result: ImportResultType,
        used_filename: String,
    },
    /// The request failed on the device
    Error { message: String },
}

impl Response {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Response::LogMsg { .. } => "LogMsg",
            Response::ModStatus(_) => "ModStatus",
            Response::Patched { .. } => "Patched",
            Response::Mods { .. } => "Mods",
            Response::ModSyncResult { .. } => "ModSyncResult",
            Response::ImportResult { .. } => "ImportResult",
            Response::Error { .. } => "Error",
        }
    }

    /// Whether this line ends the exchange for the current request
    pub fn is_final(&self) -> bool {
        !matches!(self, Response::LogMsg { .. })
    }
}

/// Install status of the app and its mod loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModStatus {
    pub app_info: Option<AppInfo>,
    pub core_mods: Option<CoreModsInfo>,
    pub modloader_install_status: InstallStatus,
    pub installed_mods: Vec<ModModel>,
}

/// Information about the installed app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub version: String,
    pub loader_installed: Option<ModLoader>,
    pub obb_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModLoader {
    QuestLoader,
    Scotland2,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    Ready,
    NeedUpdate,
    Missing,
}

/// Core mod availability for the installed app version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreModsInfo {
    pub supported_versions: Vec<String>,
    pub downgrade_versions: Vec<String>,
    pub is_awaiting_diff: bool,
    pub core_mod_install_status: InstallStatus,
}

/// A mod as reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModModel {
    pub id: String,
    pub name: String,
    pub version: String,
    pub is_enabled: bool,
    pub is_core: bool,
}

/// What an import turned out to be
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImportResultType {
    ImportedMod { installed_mods: Vec<ModModel> },
    ImportedFileCopy { copied_to: String, mod_id: String },
    ImportedSong,
    NonQuestModDetected,
}
