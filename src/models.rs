use {
    crate::{errors::DbError, schema::DOCTOR_SENTINEL_EMAIL},
    chrono::{DateTime, Utc},
    mongodb::bson::{Bson, DateTime as BsonDateTime, Document, doc, oid::ObjectId},
    serde::{Deserialize, Deserializer, Serialize, de::Error as _},
    std::collections::BTreeMap,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(crate = "rocket::serde")]
pub struct Address {
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
}

/// Slots already reserved per date key, in booking order.
///
/// A date never maps to an empty list: releasing the last slot removes the
/// date, and empty lists found in stored documents are dropped on decode.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(
    crate = "rocket::serde",
    from = "BTreeMap<String, Vec<String>>",
    into = "BTreeMap<String, Vec<String>>"
)]
pub struct SlotsBooked(BTreeMap<String, Vec<String>>);

impl From<BTreeMap<String, Vec<String>>> for SlotsBooked {
    fn from(mut map: BTreeMap<String, Vec<String>>) -> Self {
        map.retain(|_, slots| !slots.is_empty());
        SlotsBooked(map)
    }
}

impl From<SlotsBooked> for BTreeMap<String, Vec<String>> {
    fn from(slots: SlotsBooked) -> Self {
        slots.0
    }
}

impl SlotsBooked {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `slot` on `date`. Returns `false` if it was already taken.
    pub fn book(&mut self, date: &str, slot: &str) -> bool {
        let slots = self.0.entry(date.to_string()).or_default();
        if slots.iter().any(|s| s == slot) {
            return false;
        }
        slots.push(slot.to_string());
        true
    }

    /// Frees `slot` on `date`. Returns `false` if it was not booked.
    pub fn release(&mut self, date: &str, slot: &str) -> bool {
        let Some(slots) = self.0.get_mut(date) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|s| s != slot);
        let removed = slots.len() != before;
        if slots.is_empty() {
            self.0.remove(date);
        }
        removed
    }

    pub fn is_booked(&self, date: &str, slot: &str) -> bool {
        self.slots(date).iter().any(|s| s == slot)
    }

    pub fn slots(&self, date: &str) -> &[String] {
        self.0.get(date).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn dates(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_document(&self) -> Document {
        self.0
            .iter()
            .map(|(date, slots)| {
                let labels = slots.iter().cloned().map(Bson::String).collect();
                (date.clone(), Bson::Array(labels))
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(crate = "rocket::serde")]
pub struct Doctor {
    #[serde(rename = "_id")]
    pub oid: ObjectId,
    pub name: String,
    pub email: String,
    #[serde(rename = "password")]
    pub password_hash: String,
    pub speciality: String,
    pub degree: String,
    #[serde(rename = "experience")]
    pub experience_label: String,
    pub about: String,
    #[serde(default = "default_available")]
    pub available: bool,
    pub fees: f64,
    pub address: Address,
    #[serde(default, deserialize_with = "epoch_millis")]
    pub date: i64,
    #[serde(default)]
    pub slots_booked: SlotsBooked,
    /// Bumped on every `slots_booked` write; absent until the first booking.
    #[serde(default)]
    pub slots_version: i64,
    #[serde(rename = "createdAt")]
    pub created_at: BsonDateTime,
    #[serde(rename = "updatedAt")]
    pub updated_at: BsonDateTime,
}

fn default_available() -> bool {
    true
}

/// Records written by other clients may store the registration time as a
/// double, an int or a BSON date.
fn epoch_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Bson::deserialize(deserializer)? {
        Bson::Int64(ms) => Ok(ms),
        Bson::Int32(ms) => Ok(i64::from(ms)),
        Bson::Double(ms) if ms.is_finite() => Ok(ms as i64),
        Bson::DateTime(at) => Ok(at.timestamp_millis()),
        Bson::Null => Ok(0),
        other => Err(D::Error::custom(format!(
            "expected epoch milliseconds, found {:?}",
            other.element_type()
        ))),
    }
}

impl Doctor {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at.timestamp_millis())
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.updated_at.timestamp_millis())
    }

    /// Inert record used only to force the `doctors` collection into existence.
    pub fn placeholder_document() -> Document {
        doc! {
            "name": "Bootstrap Placeholder",
            "email": DOCTOR_SENTINEL_EMAIL,
            "password": "bootstrap-placeholder",
            "speciality": "General physician",
            "degree": "MD",
            "experience": "1 Year",
            "about": "Placeholder used to create the doctors collection",
            "available": false,
            "fees": 1.0,
            "address": { "line1": "Bootstrap", "line2": "Placeholder" },
            "date": Utc::now().timestamp_millis(),
            "slots_booked": {},
        }
    }
}

/// Input of the admin add-doctor flow. The password arrives already hashed.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(crate = "rocket::serde")]
pub struct NewDoctor {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub speciality: String,
    pub degree: String,
    pub experience_label: String,
    pub about: String,
    pub fees: f64,
    pub address: Address,
    pub available: Option<bool>,
}

impl NewDoctor {
    pub fn validate(&self) -> Result<(), DbError> {
        let text_fields = [
            ("name", &self.name),
            ("password", &self.password_hash),
            ("speciality", &self.speciality),
            ("degree", &self.degree),
            ("experience", &self.experience_label),
            ("about", &self.about),
        ];
        for (field, value) in text_fields {
            if value.trim().is_empty() {
                return Err(DbError::validation(field, "is required"));
            }
        }

        if !is_valid_email(&self.email) {
            return Err(DbError::validation("email", "is not a valid email address"));
        }
        if !self.fees.is_finite() || self.fees <= 0.0 {
            return Err(DbError::validation("fees", "must be greater than zero"));
        }
        if self.address.line1.trim().is_empty() {
            return Err(DbError::validation("address", "line1 is required"));
        }
        Ok(())
    }

    /// Builds the stored document. Email is lower-cased; `_id` and timestamps
    /// are left to the accessor.
    pub fn into_document(self) -> Document {
        let mut address = doc! { "line1": self.address.line1.trim() };
        if let Some(line2) = self.address.line2.filter(|l| !l.trim().is_empty()) {
            address.insert("line2", line2);
        }

        doc! {
            "name": self.name.trim(),
            "email": normalize_email(&self.email),
            "password": self.password_hash,
            "speciality": self.speciality.trim(),
            "degree": self.degree.trim(),
            "experience": self.experience_label.trim(),
            "about": self.about.trim(),
            "available": self.available.unwrap_or(true),
            "fees": self.fees,
            "address": address,
            "date": Utc::now().timestamp_millis(),
            "slots_booked": {},
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_doctor() -> NewDoctor {
        NewDoctor {
            name: "Dr. Emily Larson".into(),
            email: " Emily.Larson@Example.com ".into(),
            password_hash: "$2b$10$abcdefghijklmnop".into(),
            speciality: "Gynecologist".into(),
            degree: "MBBS".into(),
            experience_label: "3 Years".into(),
            about: "Women's health.".into(),
            fees: 60.0,
            address: Address {
                line1: "27th Cross, Richmond".into(),
                line2: Some("".into()),
            },
            available: None,
        }
    }

    #[test]
    fn releasing_last_slot_removes_date() {
        let mut slots = SlotsBooked::new();
        assert!(slots.book("16_10_2026", "10:00 AM"));
        assert!(slots.book("16_10_2026", "10:30 AM"));
        assert!(!slots.book("16_10_2026", "10:00 AM"));
        assert_eq!(slots.slots("16_10_2026"), ["10:00 AM", "10:30 AM"]);

        assert!(slots.release("16_10_2026", "10:00 AM"));
        assert!(slots.release("16_10_2026", "10:30 AM"));
        assert!(slots.is_empty());
        assert_eq!(slots.dates().count(), 0);
        assert!(!slots.release("16_10_2026", "10:30 AM"));
    }

    #[test]
    fn decoding_drops_empty_dates() {
        let stored = doc! { "01_11_2026": [], "02_11_2026": ["09:00 AM"] };
        let slots: SlotsBooked = mongodb::bson::from_document(stored).unwrap();
        assert_eq!(slots.dates().collect::<Vec<_>>(), vec!["02_11_2026"]);
        assert_eq!(slots.to_document(), doc! { "02_11_2026": ["09:00 AM"] });
    }

    #[test]
    fn new_doctor_document_is_normalised() {
        let doctor = new_doctor();
        doctor.validate().unwrap();
        let doc = doctor.into_document();
        assert_eq!(doc.get_str("email").unwrap(), "emily.larson@example.com");
        assert!(doc.get_bool("available").unwrap());
        assert_eq!(doc.get_document("address").unwrap(), &doc! { "line1": "27th Cross, Richmond" });
        assert!(doc.get_document("slots_booked").unwrap().is_empty());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let mut doctor = new_doctor();
        doctor.fees = 0.0;
        assert!(matches!(doctor.validate(), Err(DbError::Validation { field, .. }) if field == "fees"));

        let mut doctor = new_doctor();
        doctor.email = "not-an-email".into();
        assert!(doctor.validate().is_err());

        let mut doctor = new_doctor();
        doctor.name = "  ".into();
        assert!(doctor.validate().is_err());
    }

    #[test]
    fn registration_time_decodes_from_any_numeric_type() {
        let base = doc! {
            "_id": ObjectId::new(),
            "name": "Dr. Sarah Patel",
            "email": "sarah@clinic.org",
            "password": "$2b$10$hash",
            "speciality": "Dermatologist",
            "degree": "MBBS",
            "experience": "1 Year",
            "about": "Skin care.",
            "fees": 30,
            "address": { "line1": "37th Cross, Richmond" },
            "slots_booked": {},
            "createdAt": BsonDateTime::now(),
            "updatedAt": BsonDateTime::now(),
        };

        let stored = [
            Bson::Double(1_760_600_000_000.0),
            Bson::Int64(1_760_600_000_000),
            Bson::DateTime(BsonDateTime::from_millis(1_760_600_000_000)),
        ];
        for date in stored {
            let mut record = base.clone();
            record.insert("date", date);
            let doctor: Doctor = mongodb::bson::from_document(record).unwrap();
            assert_eq!(doctor.date, 1_760_600_000_000);
            assert_eq!(doctor.slots_version, 0);
            assert_eq!(doctor.fees, 30.0);
        }

        let mut record = base;
        record.insert("date", "yesterday");
        assert!(mongodb::bson::from_document::<Doctor>(record).is_err());
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a b@c.de"));
        assert!(!is_valid_email("a@b@c.de"));
    }
}
