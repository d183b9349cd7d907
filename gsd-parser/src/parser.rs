//! The GSD file parser.
//!
//! Parsing happens in two steps: a preprocessing pass extracts the
//! `#Profibus_DP` section, strips comments and expands line continuations;
//! the cleaned text is then run through the pest grammar and folded into a
//! [`GenericStationDescription`].

use pest::iterators::Pair;
use pest::Parser;

use crate::{
    ExtUserPrmData, GenericStationDescription, GsdError, Module, PrmDataConst, PrmDataRef,
    PrmText, PrmTextValue, SupportedSpeeds,
};

mod grammar {
    #[derive(pest_derive::Parser)]
    #[grammar = "gsd.pest"]
    pub struct GsdGrammar;
}

use grammar::{GsdGrammar, Rule};

/// Reduce the raw file contents to the cleaned `#Profibus_DP` section.
///
/// Comments start at a `;` outside of double quotes and run to the end of
/// the line.  A trailing backslash continues the statement on the next
/// line.  Empty lines are dropped.
fn preprocess(source: &str) -> String {
    // Find the GSD section and discard the rest.
    let mut section_lines: Vec<String> = Vec::new();
    let mut in_section = false;
    for raw in source.lines() {
        let line = raw.trim_end_matches('\r');
        if in_section {
            if line.starts_with('#') {
                break;
            }
            section_lines.push(strip_comment(line));
        } else if line.trim() == "#Profibus_DP" {
            in_section = true;
        }
    }

    // Expand line continuations.
    let mut joined: Vec<String> = Vec::new();
    let mut continuing = false;
    for mut line in section_lines {
        let continues = line.ends_with('\\');
        if continues {
            line.pop();
        }
        if continuing {
            match joined.last_mut() {
                Some(previous) => previous.push_str(&line),
                None => joined.push(line),
            }
        } else {
            joined.push(line);
        }
        continuing = continues;
    }

    // Trim and drop empty lines.
    let mut out = String::new();
    for line in joined {
        let line = line.trim();
        if !line.is_empty() {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn strip_comment(line: &str) -> String {
    let mut out = String::new();
    let mut in_quote = false;
    for c in line.chars() {
        if in_quote {
            if c == '"' {
                in_quote = false;
            }
        } else {
            if c == ';' {
                break;
            }
            if c == '"' {
                in_quote = true;
            }
        }
        out.push(c);
    }
    out.trim_end().to_string()
}

/// A decoded right-hand side of a `key = value` line.
#[derive(Debug, Clone)]
enum Value {
    Numbers(Vec<u64>),
    Text(String),
    Bare(String),
}

fn parse_number(pair: Pair<'_, Rule>) -> Option<u64> {
    match pair.as_rule() {
        Rule::dec_number => pair.as_str().parse().ok(),
        Rule::hex_number => u64::from_str_radix(pair.as_str().trim_start_matches("0x"), 16).ok(),
        _ => unreachable!("parse_number() called on a non-number pair: {:?}", pair),
    }
}

fn parse_string_literal(pair: Pair<'_, Rule>) -> String {
    debug_assert!(pair.as_rule() == Rule::string_literal);
    // Drop the quotation marks.
    let mut chars = pair.as_str().chars();
    chars.next();
    chars.next_back();
    chars.as_str().to_owned()
}

fn parse_value(pair: Pair<'_, Rule>) -> Option<Value> {
    match pair.as_rule() {
        Rule::number_list => {
            let numbers: Option<Vec<u64>> = pair.into_inner().map(parse_number).collect();
            numbers.map(Value::Numbers)
        }
        Rule::string_literal => Some(Value::Text(parse_string_literal(pair))),
        Rule::bare => Some(Value::Bare(pair.as_str().trim().to_owned())),
        _ => unreachable!("unexpected value pair: {:?}", pair),
    }
}

impl Value {
    fn as_number(&self) -> Option<u64> {
        match self {
            Value::Numbers(numbers) if numbers.len() == 1 => Some(numbers[0]),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        self.as_number().map(|n| n != 0)
    }

    fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Numbers(numbers) => numbers
                .iter()
                .map(|&n| u8::try_from(n).ok())
                .collect::<Option<Vec<u8>>>(),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        // Lenient: some real-world GSD files leave string values unquoted.
        match self {
            Value::Text(text) => Some(text.clone()),
            Value::Bare(text) => Some(text.clone()),
            Value::Numbers(_) => None,
        }
    }
}

/// A destructured `setting` pair: key, optional `(offset)`, value.
struct Setting<'a> {
    key: &'a str,
    offset: Option<u64>,
    value: Value,
}

fn destructure_setting(pair: Pair<'_, Rule>) -> Option<Setting<'_>> {
    debug_assert!(pair.as_rule() == Rule::setting);
    let mut inner = pair.into_inner();
    let key = inner.next()?.as_str();
    let mut next = inner.next()?;
    let mut offset = None;
    if next.as_rule() == Rule::offset {
        offset = parse_number(next.into_inner().next()?);
        offset?;
        next = inner.next()?;
    }
    let value = parse_value(next)?;
    Some(Setting { key, offset, value })
}

fn invalid_value(name: &str, field: &str) -> GsdError {
    GsdError::InvalidValue {
        name: name.to_string(),
        field: field.to_string(),
    }
}

macro_rules! try_value {
    ($name:expr, $setting:expr, $conv:ident) => {
        $setting
            .value
            .$conv()
            .ok_or_else(|| invalid_value($name, $setting.key))?
    };
}

fn apply_global_setting(
    gsd: &mut GenericStationDescription,
    setting: Setting<'_>,
) -> Result<(), GsdError> {
    let name = gsd.name.clone();
    let name = name.as_str();

    // Fields with an `(offset)` argument.
    match setting.key {
        "Ext_User_Prm_Data_Const" => {
            let offset = setting.offset.ok_or_else(|| invalid_value(name, setting.key))?;
            gsd.ext_user_prm_data_const.push(PrmDataConst {
                offset: offset as usize,
                data: try_value!(name, setting, as_bytes),
            });
            return Ok(());
        }
        "Ext_User_Prm_Data_Ref" => {
            let offset = setting.offset.ok_or_else(|| invalid_value(name, setting.key))?;
            let reference = try_value!(name, setting, as_number);
            gsd.ext_user_prm_data_ref.push(PrmDataRef {
                offset: offset as usize,
                reference: u32::try_from(reference)
                    .map_err(|_| invalid_value(name, setting.key))?,
            });
            return Ok(());
        }
        _ => (),
    }

    match setting.key {
        // Numbers
        "GSD_Revision" => gsd.gsd_revision = try_value!(name, setting, as_number) as u8,
        "Ident_Number" => {
            let ident = try_value!(name, setting, as_number);
            gsd.ident_number =
                Some(u16::try_from(ident).map_err(|_| invalid_value(name, setting.key))?);
        }
        "Max_Module" => gsd.max_modules = try_value!(name, setting, as_number) as u8,
        "Max_Input_Len" => gsd.max_input_length = try_value!(name, setting, as_number) as u8,
        "Max_Output_Len" => gsd.max_output_length = try_value!(name, setting, as_number) as u8,
        "Max_Data_Len" => gsd.max_data_length = try_value!(name, setting, as_number) as u16,
        "Max_Diag_Data_Len" => {
            gsd.max_diag_data_length = try_value!(name, setting, as_number) as u8
        }
        "User_Prm_Data_Len" => {
            gsd.user_prm_data_len = Some(try_value!(name, setting, as_number) as usize)
        }
        "Max_User_Prm_Data_Len" => {
            gsd.max_user_prm_data_len = Some(try_value!(name, setting, as_number) as usize)
        }

        // Booleans
        "Modular_Station" => gsd.modular_station = try_value!(name, setting, as_bool),
        "DPV1_Slave" => gsd.dpv1_slave = try_value!(name, setting, as_bool),
        "FixPresetModules" => gsd.fix_preset_modules = try_value!(name, setting, as_bool),
        "Freeze_Mode_supp" => gsd.freeze_mode_supported = try_value!(name, setting, as_bool),
        "Sync_Mode_supp" => gsd.sync_mode_supported = try_value!(name, setting, as_bool),
        "Set_Slave_Add_supp" => gsd.set_slave_addr_supported = try_value!(name, setting, as_bool),
        "Auto_Baud_supp" => gsd.auto_baud_supported = try_value!(name, setting, as_bool),
        "Fail_Safe" => gsd.fail_safe = try_value!(name, setting, as_bool),

        // Strings
        "Vendor_Name" => gsd.vendor = try_value!(name, setting, as_text),
        "Model_Name" => gsd.model = try_value!(name, setting, as_text),
        "Revision" => gsd.revision = try_value!(name, setting, as_text),
        "Hardware_Release" => gsd.hardware_release = try_value!(name, setting, as_text),
        "Software_Release" => gsd.software_release = try_value!(name, setting, as_text),
        "OrderNumber" => gsd.order_number = Some(try_value!(name, setting, as_text)),

        // Byte arrays
        "User_Prm_Data" => gsd.user_prm_data = try_value!(name, setting, as_bytes),

        "Slave_Family" => {
            gsd.slave_family = match &setting.value {
                Value::Bare(text) => text.split('@').map(str::to_string).collect(),
                Value::Text(text) => text.split('@').map(str::to_string).collect(),
                Value::Numbers(numbers) => numbers.iter().map(u64::to_string).collect(),
            };
        }

        // Supported baudrates
        "9.6_supp" => set_speed(gsd, SupportedSpeeds::B9600, &setting, name)?,
        "19.2_supp" => set_speed(gsd, SupportedSpeeds::B19200, &setting, name)?,
        "45.45_supp" => set_speed(gsd, SupportedSpeeds::B45450, &setting, name)?,
        "93.75_supp" => set_speed(gsd, SupportedSpeeds::B93750, &setting, name)?,
        "187.5_supp" => set_speed(gsd, SupportedSpeeds::B187500, &setting, name)?,
        "500_supp" => set_speed(gsd, SupportedSpeeds::B500000, &setting, name)?,
        "1.5M_supp" => set_speed(gsd, SupportedSpeeds::B1500000, &setting, name)?,
        "3M_supp" => set_speed(gsd, SupportedSpeeds::B3000000, &setting, name)?,
        "6M_supp" => set_speed(gsd, SupportedSpeeds::B6000000, &setting, name)?,
        "12M_supp" => set_speed(gsd, SupportedSpeeds::B12000000, &setting, name)?,

        // Response time limits
        "MaxTsdr_9.6" => gsd.max_tsdr.b9600 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_19.2" => gsd.max_tsdr.b19200 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_45.45" => gsd.max_tsdr.b45450 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_93.75" => gsd.max_tsdr.b93750 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_187.5" => gsd.max_tsdr.b187500 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_500" => gsd.max_tsdr.b500000 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_1.5M" => gsd.max_tsdr.b1500000 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_3M" => gsd.max_tsdr.b3000000 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_6M" => gsd.max_tsdr.b6000000 = Some(tsdr_value(name, &setting)?),
        "MaxTsdr_12M" => gsd.max_tsdr.b12000000 = Some(tsdr_value(name, &setting)?),

        key => {
            log::debug!("GSD '{}': ignored field '{}'", name, key);
        }
    }
    Ok(())
}

fn set_speed(
    gsd: &mut GenericStationDescription,
    speed: SupportedSpeeds,
    setting: &Setting<'_>,
    name: &str,
) -> Result<(), GsdError> {
    let supported = setting
        .value
        .as_bool()
        .ok_or_else(|| invalid_value(name, setting.key))?;
    gsd.supported_speeds.set(speed, supported);
    Ok(())
}

fn tsdr_value(name: &str, setting: &Setting<'_>) -> Result<u16, GsdError> {
    let value = setting
        .value
        .as_number()
        .ok_or_else(|| invalid_value(name, setting.key))?;
    u16::try_from(value).map_err(|_| invalid_value(name, setting.key))
}

fn parse_prm_text_section(
    gsd: &mut GenericStationDescription,
    pair: Pair<'_, Rule>,
) -> Result<(), GsdError> {
    let name = gsd.name.clone();
    let mut inner = pair.into_inner();
    let reference = inner
        .next()
        .and_then(parse_number)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid_value(&name, "PrmText"))?;

    let mut prm_text = PrmText {
        reference,
        values: Vec::new(),
    };
    for entry in inner {
        match entry.as_rule() {
            Rule::prm_text_value => {
                let mut value_inner = entry.into_inner();
                let value = value_inner
                    .next()
                    .and_then(parse_number)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| invalid_value(&name, "Text"))?;
                let text = value_inner
                    .next()
                    .map(parse_string_literal)
                    .ok_or_else(|| invalid_value(&name, "Text"))?;
                prm_text.values.push(PrmTextValue { value, text });
            }
            Rule::junk => {
                log::debug!(
                    "GSD '{}': ignored line in PrmText section: {}",
                    name,
                    entry.as_str()
                );
            }
            _ => unreachable!(),
        }
    }
    gsd.prm_texts.push(prm_text);
    Ok(())
}

fn parse_ext_user_prm_data_section(
    gsd: &mut GenericStationDescription,
    pair: Pair<'_, Rule>,
) -> Result<(), GsdError> {
    let name = gsd.name.clone();
    let mut inner = pair.into_inner();
    let reference = inner
        .next()
        .and_then(parse_number)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid_value(&name, "ExtUserPrmData"))?;
    let data_name = inner
        .next()
        .map(parse_string_literal)
        .ok_or_else(|| invalid_value(&name, "ExtUserPrmData"))?;

    let mut data = ExtUserPrmData {
        reference,
        name: data_name,
        prm_text_ref: None,
    };
    for entry in inner {
        match entry.as_rule() {
            Rule::setting => {
                let Some(setting) = destructure_setting(entry) else {
                    continue;
                };
                match setting.key {
                    "Prm_Text_Ref" => {
                        let reference = setting
                            .value
                            .as_number()
                            .and_then(|n| u32::try_from(n).ok())
                            .ok_or_else(|| invalid_value(&name, "Prm_Text_Ref"))?;
                        data.prm_text_ref = Some(reference);
                    }
                    key => {
                        log::debug!("GSD '{}': ignored ExtUserPrmData field '{}'", name, key);
                    }
                }
            }
            Rule::junk => {
                // Usually the data type specification line, which is not
                // needed here.
                log::debug!(
                    "GSD '{}': ignored line in ExtUserPrmData section: {}",
                    name,
                    entry.as_str()
                );
            }
            _ => unreachable!(),
        }
    }
    gsd.ext_user_prm_data.push(data);
    Ok(())
}

fn parse_module_section(
    gsd: &mut GenericStationDescription,
    pair: Pair<'_, Rule>,
) -> Result<(), GsdError> {
    let name = gsd.name.clone();
    let mut inner = pair.into_inner();
    let module_name = inner
        .next()
        .map(parse_string_literal)
        .ok_or_else(|| invalid_value(&name, "Module"))?;
    let config_pair = inner.next().ok_or_else(|| invalid_value(&name, "Module"))?;
    let config = parse_value(config_pair)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| invalid_value(&name, "Module"))?;

    let mut module = Module {
        name: module_name,
        config,
        preset: false,
        ext_module_prm_data_len: None,
        prm_data_const: Vec::new(),
        prm_data_ref: Vec::new(),
    };

    for entry in inner {
        match entry.as_rule() {
            Rule::setting => {
                let Some(setting) = destructure_setting(entry) else {
                    continue;
                };
                match setting.key {
                    "Preset" => {
                        module.preset = setting
                            .value
                            .as_bool()
                            .ok_or_else(|| invalid_value(&name, "Preset"))?;
                    }
                    "Ext_Module_Prm_Data_Len" => {
                        let length = setting
                            .value
                            .as_number()
                            .ok_or_else(|| invalid_value(&name, "Ext_Module_Prm_Data_Len"))?;
                        module.ext_module_prm_data_len = Some(length as usize);
                    }
                    "Ext_User_Prm_Data_Const" => {
                        let offset = setting
                            .offset
                            .ok_or_else(|| invalid_value(&name, "Ext_User_Prm_Data_Const"))?;
                        let data = setting
                            .value
                            .as_bytes()
                            .ok_or_else(|| invalid_value(&name, "Ext_User_Prm_Data_Const"))?;
                        module.prm_data_const.push(PrmDataConst {
                            offset: offset as usize,
                            data,
                        });
                    }
                    "Ext_User_Prm_Data_Ref" => {
                        let offset = setting
                            .offset
                            .ok_or_else(|| invalid_value(&name, "Ext_User_Prm_Data_Ref"))?;
                        let reference = setting
                            .value
                            .as_number()
                            .and_then(|n| u32::try_from(n).ok())
                            .ok_or_else(|| invalid_value(&name, "Ext_User_Prm_Data_Ref"))?;
                        module.prm_data_ref.push(PrmDataRef {
                            offset: offset as usize,
                            reference,
                        });
                    }
                    key => {
                        log::debug!("GSD '{}': ignored Module field '{}'", name, key);
                    }
                }
            }
            Rule::junk => {
                log::debug!(
                    "GSD '{}': ignored line in Module section: {}",
                    name,
                    entry.as_str()
                );
            }
            _ => unreachable!(),
        }
    }
    gsd.modules.push(module);
    Ok(())
}

/// Parse GSD source text into a [`GenericStationDescription`].
pub fn parse(name: &str, source: &str) -> Result<GenericStationDescription, GsdError> {
    let preprocessed = preprocess(source);

    let mut pairs =
        GsdGrammar::parse(Rule::gsd, &preprocessed).map_err(|e| GsdError::Parse {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    let gsd_pair = pairs.next().expect("grammar yields exactly one gsd pair");

    let mut gsd = GenericStationDescription {
        name: name.to_string(),
        ..Default::default()
    };

    for statement in gsd_pair.into_inner() {
        match statement.as_rule() {
            Rule::setting => {
                let Some(setting) = destructure_setting(statement) else {
                    continue;
                };
                apply_global_setting(&mut gsd, setting)?;
            }
            Rule::prm_text_section => parse_prm_text_section(&mut gsd, statement)?,
            Rule::ext_user_prm_data_section => {
                parse_ext_user_prm_data_section(&mut gsd, statement)?
            }
            Rule::module_section => parse_module_section(&mut gsd, statement)?,
            Rule::junk => {
                log::debug!("GSD '{}': ignored unknown line: {}", name, statement.as_str());
            }
            Rule::EOI => (),
            _ => unreachable!("unexpected statement: {:?}", statement),
        }
    }

    Ok(gsd)
}
