//! One validator per filter operator

use bson::Bson;

use super::{DeclaredType, FilterOperator, OperationValidator};
use crate::mapping::ContainerShape;

fn is_integer(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_))
}

/// `$size`: list-typed field, int32 count
pub struct SizeOperationValidator;

impl OperationValidator for SizeOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::Size
    }

    fn accepts(&self, declared: &DeclaredType, value: &Bson) -> bool {
        declared.container == ContainerShape::List && matches!(value, Bson::Int32(_))
    }
}

/// `$all`: array of candidates
pub struct AllOperationValidator;

impl OperationValidator for AllOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::All
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        matches!(value, Bson::Array(_))
    }
}

pub struct InOperationValidator;

impl OperationValidator for InOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::In
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        matches!(value, Bson::Array(_))
    }
}

pub struct NotInOperationValidator;

impl OperationValidator for NotInOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::NotIn
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        matches!(value, Bson::Array(_))
    }
}

pub struct ExistsOperationValidator;

impl OperationValidator for ExistsOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::Exists
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        matches!(value, Bson::Boolean(_))
    }
}

/// `$mod`: `[divisor, remainder]`
pub struct ModOperationValidator;

impl OperationValidator for ModOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::Mod
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        match value {
            Bson::Array(items) => items.len() == 2 && items.iter().all(is_integer),
            _ => false,
        }
    }
}

/// `$regex`: string field, pattern as string or regex
pub struct RegexOperationValidator;

impl OperationValidator for RegexOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::Regex
    }

    fn accepts(&self, declared: &DeclaredType, value: &Bson) -> bool {
        declared.element.is::<String>()
            && matches!(value, Bson::String(_) | Bson::RegularExpression(_))
    }
}

/// `$elemMatch`: container field, sub-query document
pub struct ElemMatchOperationValidator;

impl OperationValidator for ElemMatchOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::ElemMatch
    }

    fn accepts(&self, declared: &DeclaredType, value: &Bson) -> bool {
        declared.container.is_container() && matches!(value, Bson::Document(_))
    }
}

const GEO_WITHIN_SHAPES: &[&str] = &["$box", "$polygon", "$center", "$centerSphere", "$geometry"];

/// `$geoWithin`: polygonal geometry or a legacy shape operator
pub struct GeoWithinOperationValidator;

impl OperationValidator for GeoWithinOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::GeoWithin
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        let Bson::Document(document) = value else {
            return false;
        };
        if matches!(document.get_str("type"), Ok("Polygon") | Ok("MultiPolygon")) {
            return true;
        }
        GEO_WITHIN_SHAPES.iter().any(|key| document.contains_key(key))
    }
}

/// `$type`: numeric type code or type alias
pub struct TypeOperationValidator;

impl OperationValidator for TypeOperationValidator {
    fn operator(&self) -> FilterOperator {
        FilterOperator::Type
    }

    fn accepts(&self, _declared: &DeclaredType, value: &Bson) -> bool {
        is_integer(value) || matches!(value, Bson::String(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_size_requires_list_and_int32() {
        let list = DeclaredType::of::<Vec<String>>();
        let scalar = DeclaredType::of::<String>();
        let validator = SizeOperationValidator;

        assert!(validator.validate(&list, FilterOperator::Size, &Bson::Int32(3)));
        assert!(!validator.validate(&list, FilterOperator::Size, &Bson::Int64(3)));
        assert!(!validator.validate(&list, FilterOperator::Size, &Bson::String("3".into())));
        assert!(!validator.validate(&scalar, FilterOperator::Size, &Bson::Int32(3)));
        assert!(!validator.validate(&list, FilterOperator::All, &Bson::Int32(3)));
    }

    #[test]
    fn test_size_rejects_unordered_containers() {
        let validator = SizeOperationValidator;
        let set = DeclaredType::of::<HashSet<String>>();
        let map = DeclaredType::of::<HashMap<String, i32>>();
        assert!(!validator.validate(&set, FilterOperator::Size, &Bson::Int32(2)));
        assert!(!validator.validate(&map, FilterOperator::Size, &Bson::Int32(2)));
    }

    #[test]
    fn test_mod_requires_pair_of_integers() {
        let declared = DeclaredType::of::<i64>();
        let validator = ModOperationValidator;
        let pair = Bson::Array(vec![Bson::Int32(4), Bson::Int64(0)]);
        let triple = Bson::Array(vec![Bson::Int32(4), Bson::Int32(0), Bson::Int32(1)]);
        assert!(validator.accepts(&declared, &pair));
        assert!(!validator.accepts(&declared, &triple));
        assert!(!validator.accepts(&declared, &Bson::Int32(4)));
    }

    #[test]
    fn test_regex_requires_string_field() {
        let validator = RegexOperationValidator;
        assert!(validator.accepts(&DeclaredType::of::<String>(), &Bson::String("^a".into())));
        assert!(validator.accepts(&DeclaredType::of::<Vec<String>>(), &Bson::String("^a".into())));
        assert!(!validator.accepts(&DeclaredType::of::<i32>(), &Bson::String("^a".into())));
    }

    #[test]
    fn test_geo_within_shapes() {
        let declared = DeclaredType::of::<crate::geo::Point>();
        let validator = GeoWithinOperationValidator;
        let polygon = Bson::Document(doc! { "type": "Polygon", "coordinates": [] });
        let boxed = Bson::Document(doc! { "$box": [[0.0, 0.0], [1.0, 1.0]] });
        let point = Bson::Document(doc! { "type": "Point", "coordinates": [1.0, 2.0] });
        assert!(validator.accepts(&declared, &polygon));
        assert!(validator.accepts(&declared, &boxed));
        assert!(!validator.accepts(&declared, &point));
    }

    #[test]
    fn test_elem_match_requires_container() {
        let validator = ElemMatchOperationValidator;
        let query = Bson::Document(doc! { "stars": { "$gt": 3 } });
        assert!(validator.accepts(&DeclaredType::of::<Vec<bson::Document>>(), &query));
        assert!(!validator.accepts(&DeclaredType::of::<bson::Document>(), &query));
    }
}
