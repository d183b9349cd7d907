//! Parser and interpreter for PROFIBUS GSD files.
//!
//! A GSD (General Station Description) file describes a slave device: its
//! ident number, the pluggable modules, the `User_Prm_Data` defaults and
//! the timing limits.  [`GsdInterpreter`] wraps the parsed
//! [`GenericStationDescription`] and composes the configuration check data
//! and parameterization bytes for a configured module set, ready to be fed
//! into a DP master.

use std::path::{Path, PathBuf};

pub mod parser;

/// Errors of the GSD parser and interpreter.
#[derive(Debug, thiserror::Error)]
pub enum GsdError {
    #[error("failed to read GSD file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("GSD '{name}': parse error: {message}")]
    Parse { name: String, message: String },
    #[error("GSD '{name}': invalid value for '{field}'")]
    InvalidValue { name: String, field: String },
    #[error("GSD '{0}': no Ident_Number")]
    MissingIdentNumber(String),
    #[error("GSD '{name}': module '{module}' not found")]
    ModuleNotFound { name: String, module: String },
    #[error("GSD '{name}': not modifying fixed preset module at index {index}")]
    FixedPresetModule { name: String, index: usize },
    #[error("GSD '{name}': module index {index} out of range")]
    ModuleIndexOutOfRange { name: String, index: usize },
    #[error("GSD '{name}': DPV1 User_Prm_Data is shorter than 3 bytes")]
    Dpv1PrmTooShort { name: String },
    #[error("GSD '{name}': invalid baud rate {rate}")]
    InvalidBaudrate { name: String, rate: u32 },
}

bitflags::bitflags! {
    /// Baudrates a station declares support for (`9.6_supp` etc.).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SupportedSpeeds: u16 {
        const B9600 = 1 << 0;
        const B19200 = 1 << 1;
        const B45450 = 1 << 2;
        const B93750 = 1 << 3;
        const B187500 = 1 << 4;
        const B500000 = 1 << 5;
        const B1500000 = 1 << 6;
        const B3000000 = 1 << 7;
        const B6000000 = 1 << 8;
        const B12000000 = 1 << 9;
    }
}

impl Default for SupportedSpeeds {
    fn default() -> Self {
        SupportedSpeeds::empty()
    }
}

/// Maximum response times (in bit times) per baudrate (`MaxTsdr_*`).
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct MaxTsdr {
    pub b9600: Option<u16>,
    pub b19200: Option<u16>,
    pub b45450: Option<u16>,
    pub b93750: Option<u16>,
    pub b187500: Option<u16>,
    pub b500000: Option<u16>,
    pub b1500000: Option<u16>,
    pub b3000000: Option<u16>,
    pub b6000000: Option<u16>,
    pub b12000000: Option<u16>,
}

/// An `Ext_User_Prm_Data_Const(offset)` overlay.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PrmDataConst {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// An `Ext_User_Prm_Data_Ref(offset)` reference.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PrmDataRef {
    pub offset: usize,
    pub reference: u32,
}

/// One `Text(value) = "..."` entry of a `PrmText` section.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PrmTextValue {
    pub value: u32,
    pub text: String,
}

/// A `PrmText` section.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PrmText {
    pub reference: u32,
    pub values: Vec<PrmTextValue>,
}

/// An `ExtUserPrmData` section (parameter definition).
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ExtUserPrmData {
    pub reference: u32,
    pub name: String,
    pub prm_text_ref: Option<u32>,
}

/// A pluggable module described by a `Module` section.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Module {
    pub name: String,
    /// Raw configuration identifier bytes of this module.
    pub config: Vec<u8>,
    /// The module is preplugged in the device.
    pub preset: bool,
    pub ext_module_prm_data_len: Option<usize>,
    pub prm_data_const: Vec<PrmDataConst>,
    pub prm_data_ref: Vec<PrmDataRef>,
}

/// One configuration data element for a `Chk_Cfg` request.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct CfgDataElement {
    pub identifier: u8,
    pub length_bytes: Vec<u8>,
}

/// The parsed contents of a GSD file.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct GenericStationDescription {
    /// Name of the file this description was parsed from.
    pub name: String,

    pub gsd_revision: u8,
    pub vendor: String,
    pub model: String,
    pub revision: String,
    pub hardware_release: String,
    pub software_release: String,
    pub order_number: Option<String>,
    pub ident_number: Option<u16>,

    pub modular_station: bool,
    pub dpv1_slave: bool,
    pub fix_preset_modules: bool,
    pub freeze_mode_supported: bool,
    pub sync_mode_supported: bool,
    pub set_slave_addr_supported: bool,
    pub auto_baud_supported: bool,
    pub fail_safe: bool,

    pub max_modules: u8,
    pub max_input_length: u8,
    pub max_output_length: u8,
    pub max_data_length: u16,
    pub max_diag_data_length: u8,

    pub user_prm_data: Vec<u8>,
    pub user_prm_data_len: Option<usize>,
    pub max_user_prm_data_len: Option<usize>,
    pub ext_user_prm_data_const: Vec<PrmDataConst>,
    pub ext_user_prm_data_ref: Vec<PrmDataRef>,
    pub prm_texts: Vec<PrmText>,
    pub ext_user_prm_data: Vec<ExtUserPrmData>,

    pub slave_family: Vec<String>,
    pub supported_speeds: SupportedSpeeds,
    pub max_tsdr: MaxTsdr,

    pub modules: Vec<Module>,
}

/// Interpreter over a parsed GSD: tracks the configured module set and
/// composes the bytes the DP master needs.
#[derive(Debug, Clone)]
pub struct GsdInterpreter {
    gsd: GenericStationDescription,
    /// Indices into `gsd.modules` of the configured (plugged) modules.
    configured: Vec<usize>,
}

impl GsdInterpreter {
    /// Parse a GSD file (ISO 8859-1 encoded).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GsdError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| GsdError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // Latin-1 maps byte-for-byte onto the first 256 code points.
        let source: String = bytes.iter().map(|&b| char::from(b)).collect();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_source(&name, &source)
    }

    /// Parse GSD data from a string.
    pub fn from_source(name: &str, source: &str) -> Result<Self, GsdError> {
        Ok(Self::new(parser::parse(name, source)?))
    }

    /// Wrap an already parsed description.
    ///
    /// Preset modules start out configured.  For a compact (non-modular)
    /// station, all modules are considered plugged.
    pub fn new(gsd: GenericStationDescription) -> Self {
        let mut interp = Self {
            gsd,
            configured: Vec::new(),
        };
        interp.add_preset_modules(false);
        if !interp.is_modular() {
            interp.add_all_modules();
        }
        interp
    }

    fn add_preset_modules(&mut self, only_fixed: bool) {
        if only_fixed && !self.gsd.fix_preset_modules {
            return;
        }
        for (index, module) in self.gsd.modules.iter().enumerate() {
            if module.preset {
                self.configured.push(index);
            }
        }
    }

    fn add_all_modules(&mut self) {
        for (index, module) in self.gsd.modules.iter().enumerate() {
            if !module.preset {
                self.configured.push(index);
            }
        }
    }

    #[inline(always)]
    pub fn gsd(&self) -> &GenericStationDescription {
        &self.gsd
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.gsd.name
    }

    /// The ident number of the station.  Its absence is an error.
    pub fn ident_number(&self) -> Result<u16, GsdError> {
        self.gsd
            .ident_number
            .ok_or_else(|| GsdError::MissingIdentNumber(self.gsd.name.clone()))
    }

    pub fn is_modular(&self) -> bool {
        self.gsd.modular_station
    }

    pub fn is_dpv1(&self) -> bool {
        self.gsd.dpv1_slave
    }

    /// Find a module by name.
    ///
    /// Tries, in order: exact match, case-insensitive match, unique prefix
    /// match, closest match by string similarity.
    pub fn find_module(&self, name: &str) -> Option<&Module> {
        self.find_module_index(name).map(|i| &self.gsd.modules[i])
    }

    fn find_module_index(&self, find: &str) -> Option<usize> {
        let modules = &self.gsd.modules;
        if modules.is_empty() {
            return None;
        }
        let find_lower = find.trim().to_lowercase();

        let exact: Vec<usize> = (0..modules.len())
            .filter(|&i| modules[i].name == find)
            .collect();
        if exact.len() == 1 {
            return Some(exact[0]);
        }

        let case_insensitive: Vec<usize> = (0..modules.len())
            .filter(|&i| modules[i].name.trim().to_lowercase() == find_lower)
            .collect();
        if case_insensitive.len() == 1 {
            return Some(case_insensitive[0]);
        }

        let prefix: Vec<usize> = (0..modules.len())
            .filter(|&i| modules[i].name.trim().to_lowercase().starts_with(&find_lower))
            .collect();
        if prefix.len() == 1 {
            return Some(prefix[0]);
        }

        (0..modules.len())
            .map(|i| (i, strsim::normalized_levenshtein(find, &modules[i].name)))
            .filter(|&(_, score)| score >= 0.6)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Remove all configured modules, except for fixed preset modules.
    pub fn clear_configured_modules(&mut self) {
        self.configured.clear();
        self.add_preset_modules(true);
    }

    /// Configure a module as plugged into the device.
    ///
    /// With `index = Some(i)` the module at position `i` of the configured
    /// set is replaced, otherwise the module is appended.
    pub fn set_configured_module(
        &mut self,
        module_name: &str,
        index: Option<usize>,
    ) -> Result<(), GsdError> {
        self.check_fixed_preset(index)?;
        let module_index =
            self.find_module_index(module_name)
                .ok_or_else(|| GsdError::ModuleNotFound {
                    name: self.gsd.name.clone(),
                    module: module_name.to_string(),
                })?;
        match index {
            Some(i) if i < self.configured.len() => self.configured[i] = module_index,
            _ => self.configured.push(module_index),
        }
        Ok(())
    }

    /// Remove the configured module at `index`.
    pub fn remove_configured_module(&mut self, index: usize) -> Result<(), GsdError> {
        if index >= self.configured.len() {
            return Err(GsdError::ModuleIndexOutOfRange {
                name: self.gsd.name.clone(),
                index,
            });
        }
        self.check_fixed_preset(Some(index))?;
        self.configured.remove(index);
        Ok(())
    }

    fn check_fixed_preset(&self, index: Option<usize>) -> Result<(), GsdError> {
        if let Some(index) = index {
            if index < self.configured.len()
                && self.gsd.fix_preset_modules
                && self.gsd.modules[self.configured[index]].preset
            {
                return Err(GsdError::FixedPresetModule {
                    name: self.gsd.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }

    /// The currently configured (plugged) modules.
    pub fn configured_modules(&self) -> Vec<&Module> {
        self.configured
            .iter()
            .map(|&i| &self.gsd.modules[i])
            .collect()
    }

    /// Configuration data elements for a `Chk_Cfg` request, one per
    /// configured module.
    pub fn cfg_data_elements(&self) -> Vec<CfgDataElement> {
        self.configured
            .iter()
            .map(|&i| {
                let config = &self.gsd.modules[i].config;
                CfgDataElement {
                    identifier: config.first().copied().unwrap_or(0),
                    length_bytes: config.get(1..).unwrap_or_default().to_vec(),
                }
            })
            .collect()
    }

    /// Compose the `User_Prm_Data` for this station and its configured
    /// modules.
    ///
    /// `dpv1_override` optionally masks/sets bits of the first three octets
    /// on DPV1 stations.
    pub fn user_prm_data(
        &self,
        dpv1_override: Option<(&[u8; 3], &[u8; 3])>,
    ) -> Result<Vec<u8>, GsdError> {
        fn merge(base: &mut Vec<u8>, offset: usize, data: &[u8]) {
            if base.len() < offset + data.len() {
                base.resize(offset + data.len(), 0);
            }
            base[offset..offset + data.len()].copy_from_slice(data);
        }
        fn trunc(name: &str, data: &mut Vec<u8>, length: Option<usize>, field: &str, extend: bool) {
            let Some(length) = length else { return };
            if extend && data.len() < length {
                data.resize(length, 0);
            }
            if data.len() > length {
                log::warn!("GSD '{}': User_Prm_Data truncated by {}", name, field);
                data.truncate(length);
            }
        }

        let name = &self.gsd.name;
        let mut data = self.gsd.user_prm_data.clone();
        trunc(
            name,
            &mut data,
            self.gsd.user_prm_data_len,
            "User_Prm_Data_Len",
            true,
        );
        for data_const in &self.gsd.ext_user_prm_data_const {
            merge(&mut data, data_const.offset, &data_const.data);
        }

        // Append the per-module parameter data.
        for &i in &self.configured {
            let module = &self.gsd.modules[i];
            let mut module_data = Vec::new();
            for data_const in &module.prm_data_const {
                merge(&mut module_data, data_const.offset, &data_const.data);
            }
            trunc(
                name,
                &mut module_data,
                module.ext_module_prm_data_len,
                "Ext_Module_Prm_Data_Len",
                true,
            );
            data.extend_from_slice(&module_data);
        }

        if self.is_dpv1() {
            if let Some((mask, set)) = dpv1_override {
                if data.len() < 3 {
                    return Err(GsdError::Dpv1PrmTooShort { name: name.clone() });
                }
                for i in 0..3 {
                    data[i] = (data[i] & !mask[i]) | (set[i] & mask[i]);
                }
            }
        } else if dpv1_override.is_some() {
            log::warn!("GSD '{}': DPV1 User_Prm_Data override ignored", name);
        }

        trunc(
            name,
            &mut data,
            self.gsd.max_user_prm_data_len,
            "Max_User_Prm_Data_Len",
            false,
        );
        Ok(data)
    }

    /// The `MaxTsdr_*` limit for a baudrate in bit/s, if the GSD declares
    /// one.
    pub fn max_tsdr(&self, rate: u32) -> Result<Option<u16>, GsdError> {
        let tsdr = &self.gsd.max_tsdr;
        match rate {
            9600 => Ok(tsdr.b9600),
            19200 => Ok(tsdr.b19200),
            45450 => Ok(tsdr.b45450),
            93750 => Ok(tsdr.b93750),
            187500 => Ok(tsdr.b187500),
            500000 => Ok(tsdr.b500000),
            1500000 => Ok(tsdr.b1500000),
            3000000 => Ok(tsdr.b3000000),
            6000000 => Ok(tsdr.b6000000),
            12000000 => Ok(tsdr.b12000000),
            rate => Err(GsdError::InvalidBaudrate {
                name: self.gsd.name.clone(),
                rate,
            }),
        }
    }

    /// Look up a `PrmText` section by its reference number.
    pub fn prm_text(&self, reference: u32) -> Option<&PrmText> {
        self.gsd.prm_texts.iter().find(|t| t.reference == reference)
    }
}

impl core::fmt::Display for GsdInterpreter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let gsd = &self.gsd;
        if !gsd.name.is_empty() {
            writeln!(f, "File:              {}", gsd.name)?;
        }
        write!(
            f,
            "Device:            {}; {}; {}; Ident ",
            gsd.vendor, gsd.model, gsd.revision
        )?;
        match gsd.ident_number {
            Some(ident) => writeln!(f, "0x{ident:04X}")?,
            None => writeln!(f, "-")?,
        }
        if let Some(order) = &gsd.order_number {
            writeln!(f, "Order number:      {}", order)?;
        }
        for module in &gsd.modules {
            if !module.preset {
                writeln!(f, "Available module:  \"{}\"", module.name)?;
            }
        }
        Ok(())
    }
}
