use chrono::{DateTime, Utc};
use garde::Validate;
use serde::Deserialize;

use crate::models::test_record::{Location, Operator, TestMetadata};

/// Form fields sent alongside the scan on upload.
#[derive(Debug, Clone, Default, Validate)]
pub struct UploadFields {
    #[garde(length(min = 1, max = 200))]
    pub person_id: String,

    #[garde(length(min = 1, max = 200))]
    pub operator_id: String,

    #[garde(length(min = 1, max = 200))]
    pub operator_name: String,

    #[garde(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,

    #[garde(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
}

impl UploadFields {
    /// Record one multipart text field. Unknown names are ignored.
    pub fn set(&mut self, name: &str, value: String) -> Result<(), MetadataError> {
        match name {
            "person_id" => self.person_id = value,
            "operator_id" => self.operator_id = value,
            "operator_name" => self.operator_name = value,
            "lat" | "latitude" => self.latitude = parse_coordinate(name, &value)?,
            "lon" | "longitude" => self.longitude = parse_coordinate(name, &value)?,
            _ => {}
        }
        Ok(())
    }

    /// Validate and stamp the metadata with the upload time.
    pub fn into_metadata(self, test_timestamp: DateTime<Utc>) -> Result<TestMetadata, MetadataError> {
        self.validate().map_err(MetadataError::Invalid)?;
        let location = location_pair(self.latitude, self.longitude)?;
        Ok(TestMetadata {
            person_id: self.person_id,
            operator: Operator {
                id: self.operator_id,
                name: self.operator_name,
            },
            location,
            test_timestamp,
        })
    }
}

fn parse_coordinate(name: &str, value: &str) -> Result<Option<f64>, MetadataError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<f64>()
        .map(Some)
        .map_err(|_| MetadataError::NotANumber {
            field: name.to_string(),
            value: value.to_string(),
        })
}

fn location_pair(
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<Option<Location>, MetadataError> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Ok(Some(Location {
            latitude,
            longitude,
        })),
        (None, None) => Ok(None),
        _ => Err(MetadataError::PartialLocation),
    }
}

fn not_in_future(value: &Option<DateTime<Utc>>, _ctx: &()) -> garde::Result {
    match value {
        Some(ts) if *ts > Utc::now() => {
            Err(garde::Error::new("test timestamp cannot be in the future"))
        }
        _ => Ok(()),
    }
}

/// Body of `POST /api/v1/scans/{id}/metadata`. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct MetadataUpdate {
    #[garde(length(min = 1, max = 200))]
    pub person_id: Option<String>,

    #[garde(length(min = 1, max = 200))]
    pub operator_id: Option<String>,

    #[garde(length(min = 1, max = 200))]
    pub operator_name: Option<String>,

    #[garde(custom(not_in_future))]
    pub test_timestamp: Option<DateTime<Utc>>,

    #[garde(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,

    #[garde(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
}

/// Validated metadata change, one optional value per stored group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub person_id: Option<String>,
    pub operator: Option<Operator>,
    pub location: Option<Location>,
    pub test_timestamp: Option<DateTime<Utc>>,
}

impl MetadataUpdate {
    pub fn into_patch(self) -> Result<MetadataPatch, MetadataError> {
        self.validate().map_err(MetadataError::Invalid)?;

        let operator = match (self.operator_id, self.operator_name) {
            (Some(id), Some(name)) => Some(Operator { id, name }),
            (None, None) => None,
            _ => return Err(MetadataError::PartialOperator),
        };
        let patch = MetadataPatch {
            person_id: self.person_id,
            operator,
            location: location_pair(self.latitude, self.longitude)?,
            test_timestamp: self.test_timestamp,
        };

        if patch == MetadataPatch::default() {
            return Err(MetadataError::Empty);
        }
        Ok(patch)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid metadata: {0}")]
    Invalid(garde::Report),

    #[error("{field} is not a number: {value:?}")]
    NotANumber { field: String, value: String },

    #[error("latitude and longitude must be given together")]
    PartialLocation,

    #[error("operator_id and operator_name must be given together")]
    PartialOperator,

    #[error("no metadata fields to update")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn upload_fields() -> UploadFields {
        let mut fields = UploadFields::default();
        fields.set("person_id", "P-1001".to_string()).unwrap();
        fields.set("operator_id", "op-7".to_string()).unwrap();
        fields.set("operator_name", "Dana Reyes".to_string()).unwrap();
        fields
    }

    #[test]
    fn test_upload_fields_without_location() {
        let now = Utc::now();
        let metadata = upload_fields().into_metadata(now).unwrap();
        assert_eq!(metadata.person_id, "P-1001");
        assert_eq!(metadata.operator.name, "Dana Reyes");
        assert!(metadata.location.is_none());
        assert_eq!(metadata.test_timestamp, now);
    }

    #[test]
    fn test_upload_fields_with_location() {
        let mut fields = upload_fields();
        fields.set("lat", "40.4168".to_string()).unwrap();
        fields.set("lon", "-3.7038".to_string()).unwrap();
        let location = fields.into_metadata(Utc::now()).unwrap().location.unwrap();
        assert_eq!(location.latitude, 40.4168);
        assert_eq!(location.longitude, -3.7038);
    }

    #[test]
    fn test_upload_requires_person_and_operator() {
        let mut fields = upload_fields();
        fields.operator_name.clear();
        assert!(matches!(
            fields.into_metadata(Utc::now()),
            Err(MetadataError::Invalid(_))
        ));
        assert!(UploadFields::default().into_metadata(Utc::now()).is_err());
    }

    #[test]
    fn test_upload_rejects_bad_coordinates() {
        let mut fields = upload_fields();
        assert!(matches!(
            fields.set("lat", "north".to_string()),
            Err(MetadataError::NotANumber { .. })
        ));

        fields.set("lat", "91".to_string()).unwrap();
        fields.set("lon", "0".to_string()).unwrap();
        assert!(matches!(
            fields.into_metadata(Utc::now()),
            Err(MetadataError::Invalid(_))
        ));

        let mut fields = upload_fields();
        fields.set("lat", "10".to_string()).unwrap();
        assert!(matches!(
            fields.into_metadata(Utc::now()),
            Err(MetadataError::PartialLocation)
        ));
    }

    #[test]
    fn test_update_rejects_future_timestamp() {
        let update = MetadataUpdate {
            test_timestamp: Some(Utc::now() + Duration::hours(1)),
            ..MetadataUpdate::default()
        };
        assert!(matches!(update.into_patch(), Err(MetadataError::Invalid(_))));

        let earlier = Utc::now() - Duration::hours(1);
        let patch = MetadataUpdate {
            test_timestamp: Some(earlier),
            ..MetadataUpdate::default()
        }
        .into_patch()
        .unwrap();
        assert_eq!(patch.test_timestamp, Some(earlier));
    }

    #[test]
    fn test_update_range_checks() {
        let update = MetadataUpdate {
            latitude: Some(45.0),
            longitude: Some(-181.0),
            ..MetadataUpdate::default()
        };
        assert!(matches!(update.into_patch(), Err(MetadataError::Invalid(_))));
    }

    #[test]
    fn test_update_groups_must_be_complete() {
        let update = MetadataUpdate {
            operator_id: Some("op-9".to_string()),
            ..MetadataUpdate::default()
        };
        assert!(matches!(update.into_patch(), Err(MetadataError::PartialOperator)));

        assert!(matches!(
            MetadataUpdate::default().into_patch(),
            Err(MetadataError::Empty)
        ));
    }

    #[test]
    fn test_update_from_json() {
        let update: MetadataUpdate = serde_json::from_str(
            r#"{"person_id": "P-2002", "operator_id": "op-1", "operator_name": "Sam Ortiz"}"#,
        )
        .unwrap();
        let patch = update.into_patch().unwrap();
        assert_eq!(patch.person_id.as_deref(), Some("P-2002"));
        assert_eq!(patch.operator.unwrap().id, "op-1");
        assert!(patch.location.is_none());
    }
}
