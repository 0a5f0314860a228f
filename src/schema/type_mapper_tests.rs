use super::converter::TargetColumn;
use super::table::ColumnDescriptor;
use super::types::{map_type, SourceKind, SourceType, TargetType};

fn mapped(name: &str) -> String {
    map_type(&SourceType::new(name)).to_string()
}

fn column_type(source: SourceType, nullable: bool) -> String {
    TargetColumn::from(&ColumnDescriptor::new("c", source, nullable)).type_name()
}

#[test]
fn test_integer_types() {
    let cases = [
        ("tinyint", "Int8"),
        ("smallint", "Int16"),
        ("mediumint", "Int32"),
        ("int", "Int32"),
        ("integer", "Int32"),
        ("bigint", "Int64"),
    ];

    for (source, expected) in cases {
        assert_eq!(mapped(source), expected, "Failed for {}", source);
    }
}

#[test]
fn test_unsigned_integers_are_not_widened() {
    // Known range limitation: unsigned values above the signed maximum wrap.
    assert_eq!(mapped("tinyint unsigned"), "Int8");
    assert_eq!(mapped("INT UNSIGNED"), "Int32");
    assert_eq!(mapped("bigint(20) unsigned"), "Int64");
    assert_eq!(mapped("int(10) unsigned zerofill"), "Int32");
}

#[test]
fn test_floating_point_types() {
    assert_eq!(mapped("float"), "Float32");
    assert_eq!(mapped("double"), "Float64");
    assert_eq!(mapped("real"), "Float64");
}

#[test]
fn test_decimal_with_precision() {
    let source = SourceType::new("decimal").with_precision(10, 2);
    assert_eq!(
        map_type(&source),
        TargetType::Decimal {
            precision: 10,
            scale: 2
        }
    );
    assert_eq!(column_type(source, false), "Decimal(10, 2)");

    let numeric = SourceType::new("numeric").with_precision(38, 9);
    assert_eq!(column_type(numeric, false), "Decimal(38, 9)");
}

#[test]
fn test_decimal_without_precision() {
    assert_eq!(mapped("decimal"), "Decimal(10, 0)");
}

#[test]
fn test_boolean_types() {
    assert_eq!(mapped("bool"), "Bool");
    assert_eq!(mapped("boolean"), "Bool");
}

#[test]
fn test_temporal_types() {
    assert_eq!(mapped("date"), "Date");
    assert_eq!(mapped("datetime"), "DateTime");
    assert_eq!(mapped("timestamp"), "DateTime");
    assert_eq!(mapped("time"), "String");
    assert_eq!(mapped("year"), "UInt16");
}

#[test]
fn test_string_and_binary_types() {
    let types = [
        "char", "varchar", "text", "tinytext", "mediumtext", "longtext", "binary", "varbinary",
        "blob", "tinyblob", "mediumblob", "longblob", "enum", "set", "json",
    ];

    for source in types {
        assert_eq!(mapped(source), "String", "Failed for {}", source);
    }
}

#[test]
fn test_bit_type() {
    assert_eq!(mapped("bit"), "UInt64");
}

#[test]
fn test_unknown_type_defaults_to_string() {
    assert_eq!(SourceKind::from_name("geometry"), SourceKind::Unknown);
    assert_eq!(mapped("geometry"), "String");
    assert_eq!(mapped(""), "String");
}

#[test]
fn test_type_names_are_normalized() {
    assert_eq!(SourceKind::from_name("VARCHAR(255)"), SourceKind::VarChar);
    assert_eq!(SourceKind::from_name("  Decimal(12,4) "), SourceKind::Decimal);
    assert_eq!(SourceKind::from_name("enum('a','b')"), SourceKind::Enum);
}

#[test]
fn test_nullable_wrapping_is_orthogonal() {
    assert_eq!(column_type(SourceType::new("tinyint"), false), "Int8");
    assert_eq!(column_type(SourceType::new("tinyint"), true), "Nullable(Int8)");
    assert_eq!(column_type(SourceType::new("varchar"), true), "Nullable(String)");
    assert_eq!(
        column_type(SourceType::new("decimal").with_precision(10, 2), true),
        "Nullable(Decimal(10, 2))"
    );
    assert_eq!(
        column_type(SourceType::new("decimal").with_precision(18, 4), true),
        "Nullable(Decimal(18, 4))"
    );
    assert_eq!(column_type(SourceType::new("mystery"), true), "Nullable(String)");
}
