use gsd_parser::{GsdError, GsdInterpreter};

const COMPACT_GSD: &str = r#"
;<-- Comment header of the device database file
#Profibus_DP
GSD_Revision        = 1
Vendor_Name         = "Acme Automation"    ; trailing comment
Model_Name          = "Compact I/O"
Revision            = "V1.0"
Ident_Number        = 0x4224
OrderNumber         = "750-333"
Freeze_Mode_supp    = 1
Sync_Mode_supp      = 1
9.6_supp            = 1
19.2_supp           = 1
MaxTsdr_9.6         = 60
MaxTsdr_19.2        = 60
Slave_Family        = 3@Remote IO
Modular_Station     = 0
User_Prm_Data_Len   = 4
User_Prm_Data       = 0x00,0x00,\
0x00,0x42
Module = "1 byte in, 1 byte out" 0x31
EndModule
"#;

const MODULAR_GSD: &str = r#"
#Profibus_DP
GSD_Revision        = 2
Vendor_Name         = "Acme Automation"
Model_Name          = "Modular Station"
Ident_Number        = 0xB754
Modular_Station     = 1
Max_Module          = 3
DPV1_Slave          = 1
User_Prm_Data_Len   = 3
User_Prm_Data       = 0x00,0x00,0x00
Ext_User_Prm_Data_Const(1) = 0x07
Max_User_Prm_Data_Len = 8

PrmText = 1
Text(0) = "inactive"
Text(1) = "active"
EndPrmText

ExtUserPrmData = 1 "Input filter"
Unsigned8 0 0-1
Prm_Text_Ref = 1
EndExtUserPrmData

Module = "2 DI / 24 V DC" 0x10
EndModule
Module = "2 DO / 24 V DC" 0x20
Ext_Module_Prm_Data_Len = 2
Ext_User_Prm_Data_Const(0) = 0xAA,0xBB
EndModule
Module = "Bus Coupler" 0x00
Preset = 1
EndModule
"#;

#[test]
fn compact_station_fields() {
    let gsd = GsdInterpreter::from_source("compact.gsd", COMPACT_GSD).unwrap();

    assert_eq!(gsd.ident_number().unwrap(), 0x4224);
    assert!(!gsd.is_modular());
    assert!(!gsd.is_dpv1());

    let fields = gsd.gsd();
    assert_eq!(fields.vendor, "Acme Automation");
    assert_eq!(fields.model, "Compact I/O");
    assert_eq!(fields.order_number.as_deref(), Some("750-333"));
    assert_eq!(fields.gsd_revision, 1);
    assert!(fields.freeze_mode_supported);
    assert!(fields.sync_mode_supported);
    assert_eq!(fields.slave_family, vec!["3", "Remote IO"]);
    assert_eq!(fields.max_tsdr.b9600, Some(60));
    assert_eq!(gsd.max_tsdr(19200).unwrap(), Some(60));
    assert_eq!(gsd.max_tsdr(500000).unwrap(), None);
    assert!(matches!(
        gsd.max_tsdr(115200),
        Err(GsdError::InvalidBaudrate { rate: 115200, .. })
    ));
}

#[test]
fn compact_station_user_prm_data() {
    // Line continuation in User_Prm_Data and no configured overlays: the
    // plain parameter bytes come back.
    let gsd = GsdInterpreter::from_source("compact.gsd", COMPACT_GSD).unwrap();
    assert_eq!(
        gsd.user_prm_data(None).unwrap(),
        vec![0x00, 0x00, 0x00, 0x42]
    );
}

#[test]
fn compact_station_configures_all_modules() {
    let gsd = GsdInterpreter::from_source("compact.gsd", COMPACT_GSD).unwrap();
    let elements = gsd.cfg_data_elements();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].identifier, 0x31);
    assert!(elements[0].length_bytes.is_empty());
}

#[test]
fn missing_ident_number_is_an_error() {
    let source = "#Profibus_DP\nVendor_Name = \"Acme\"\n";
    let gsd = GsdInterpreter::from_source("bad.gsd", source).unwrap();
    assert!(matches!(
        gsd.ident_number(),
        Err(GsdError::MissingIdentNumber(_))
    ));
}

#[test]
fn modular_station_starts_with_presets() {
    let gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    assert!(gsd.is_modular());
    assert!(gsd.is_dpv1());

    let configured = gsd.configured_modules();
    assert_eq!(configured.len(), 1);
    assert_eq!(configured[0].name, "Bus Coupler");
}

#[test]
fn module_matching_tiers() {
    let mut gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    gsd.clear_configured_modules();

    // Exact match
    gsd.set_configured_module("2 DI / 24 V DC", None).unwrap();
    // Case-insensitive match
    gsd.set_configured_module("2 do / 24 v dc", None).unwrap();
    // Unique prefix
    gsd.set_configured_module("Bus", None).unwrap();
    // Closest match
    gsd.set_configured_module("2 DI / 24V DC", None).unwrap();

    let names: Vec<&str> = gsd
        .configured_modules()
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["2 DI / 24 V DC", "2 DO / 24 V DC", "Bus Coupler", "2 DI / 24 V DC"]
    );

    assert!(matches!(
        gsd.set_configured_module("Completely unrelated name", None),
        Err(GsdError::ModuleNotFound { .. })
    ));
}

#[rstest::rstest]
#[case("2 DI / 24 V DC", "2 DI / 24 V DC")]
#[case("2 do / 24 v dc", "2 DO / 24 V DC")]
#[case("Bus", "Bus Coupler")]
#[case("2 DI / 24V DC", "2 DI / 24 V DC")]
fn module_lookup(#[case] query: &str, #[case] expected: &str) {
    let gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    assert_eq!(gsd.find_module(query).unwrap().name, expected);
}

#[test]
fn replace_and_remove_configured_modules() {
    let mut gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    gsd.clear_configured_modules();
    gsd.set_configured_module("2 DI / 24 V DC", None).unwrap();
    gsd.set_configured_module("2 DO / 24 V DC", Some(0)).unwrap();
    assert_eq!(gsd.configured_modules()[0].name, "2 DO / 24 V DC");

    gsd.remove_configured_module(0).unwrap();
    assert!(gsd.configured_modules().is_empty());
    assert!(matches!(
        gsd.remove_configured_module(0),
        Err(GsdError::ModuleIndexOutOfRange { index: 0, .. })
    ));
}

#[test]
fn modular_user_prm_data_composition() {
    let mut gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    gsd.clear_configured_modules();
    gsd.set_configured_module("2 DO / 24 V DC", None).unwrap();

    // Global data [0x00, 0x00, 0x00] with the const overlay at offset 1,
    // plus the module overlay [0xAA, 0xBB].
    assert_eq!(
        gsd.user_prm_data(None).unwrap(),
        vec![0x00, 0x07, 0x00, 0xAA, 0xBB]
    );
}

#[test]
fn max_user_prm_data_len_truncates() {
    let mut gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    gsd.clear_configured_modules();
    for _ in 0..3 {
        gsd.set_configured_module("2 DO / 24 V DC", None).unwrap();
    }
    // 3 + 3 * 2 bytes, truncated (not extended) to Max_User_Prm_Data_Len.
    let data = gsd.user_prm_data(None).unwrap();
    assert_eq!(data.len(), 8);
    assert_eq!(data, vec![0x00, 0x07, 0x00, 0xAA, 0xBB, 0xAA, 0xBB, 0xAA]);
}

#[test]
fn dpv1_prm_override() {
    let gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    let data = gsd
        .user_prm_data(Some((&[0x80, 0x00, 0xFF], &[0x80, 0x00, 0x42])))
        .unwrap();
    assert_eq!(data[0], 0x80);
    assert_eq!(data[1], 0x07);
    assert_eq!(data[2], 0x42);
}

#[test]
fn prm_text_sections_are_parsed() {
    let gsd = GsdInterpreter::from_source("modular.gsd", MODULAR_GSD).unwrap();
    let prm_text = gsd.prm_text(1).unwrap();
    assert_eq!(prm_text.values.len(), 2);
    assert_eq!(prm_text.values[0].text, "inactive");
    assert_eq!(prm_text.values[1].value, 1);

    let ext = &gsd.gsd().ext_user_prm_data;
    assert_eq!(ext.len(), 1);
    assert_eq!(ext[0].name, "Input filter");
    assert_eq!(ext[0].prm_text_ref, Some(1));
}

#[test]
fn data_outside_the_dp_section_is_ignored() {
    let source = "\
junk before the section
#Profibus_FOO
Ident_Number = 0x9999
#Profibus_DP
Ident_Number = 0x1234
#Another_Section
Ident_Number = 0x5678
";
    let gsd = GsdInterpreter::from_source("sectioned.gsd", source).unwrap();
    assert_eq!(gsd.ident_number().unwrap(), 0x1234);
}
