//! # Doctor operations
//!
//! Typed reads and writes over the registered `Doctor` accessor. Slot
//! bookings go through [`SlotsBooked`] so a date never persists with an empty
//! slot list, and are written against the `slots_version` counter read with
//! them so concurrent bookings on one doctor do not overwrite each other.

use mongodb::bson::{Bson, Document, doc, oid::ObjectId};

use crate::{
    errors::DbError,
    models::{Doctor, NewDoctor, SlotsBooked, normalize_email},
    registry::Accessor,
    schema::DOCTOR_SENTINEL_EMAIL,
};

const BOOKING_ATTEMPTS: usize = 3;
const SLOTS_VERSION: &str = "slots_version";

#[derive(Clone)]
pub struct Doctors {
    accessor: Accessor,
}

impl Doctors {
    pub fn new(accessor: Accessor) -> Self {
        Self { accessor }
    }

    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    /// Adds a doctor. A second doctor with the same email, in any letter
    /// case, fails with `DuplicateKey`.
    pub async fn insert(&self, new_doctor: NewDoctor) -> Result<Doctor, DbError> {
        new_doctor.validate()?;
        let stored = self.accessor.insert(new_doctor.into_document()).await?;
        decode(stored)
    }

    pub async fn find_by_id(&self, id: ObjectId) -> Result<Option<Doctor>, DbError> {
        self.accessor.find_one_as(doc! { "_id": id }).await
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Doctor>, DbError> {
        self.accessor
            .find_one_as(doc! { "email": normalize_email(email) })
            .await
    }

    /// All doctors, or only those accepting appointments.
    pub async fn list(&self, only_available: bool) -> Result<Vec<Doctor>, DbError> {
        let filter = if only_available {
            doc! { "available": true }
        } else {
            doc! {}
        };
        let doctors: Vec<Doctor> = self.accessor.find_as(filter).await?;
        Ok(doctors
            .into_iter()
            .filter(|d| d.email != DOCTOR_SENTINEL_EMAIL)
            .collect())
    }

    pub async fn set_available(&self, id: ObjectId, available: bool) -> Result<(), DbError> {
        self.update(id, doc! { "available": available }).await
    }

    pub async fn set_fees(&self, id: ObjectId, fees: f64) -> Result<(), DbError> {
        if !fees.is_finite() || fees <= 0.0 {
            return Err(DbError::validation("fees", "must be greater than zero"));
        }
        self.update(id, doc! { "fees": fees }).await
    }

    pub async fn set_about(&self, id: ObjectId, about: &str) -> Result<(), DbError> {
        if about.trim().is_empty() {
            return Err(DbError::validation("about", "must not be empty"));
        }
        self.update(id, doc! { "about": about.trim() }).await
    }

    /// Reserves `slot` on `date`. Fails with `Validation` when the doctor is
    /// unavailable or the slot is taken.
    pub async fn book_slot(
        &self,
        id: ObjectId,
        date: &str,
        slot: &str,
    ) -> Result<SlotsBooked, DbError> {
        if date.trim().is_empty() || slot.trim().is_empty() {
            return Err(DbError::validation("slot", "date and time are required"));
        }

        self.modify_slots(id, |doctor, slots| {
            if !doctor.available {
                return Err(DbError::validation("available", "doctor is not available"));
            }
            if !slots.book(date, slot) {
                return Err(DbError::validation("slot", format!("{date} {slot} is already booked")));
            }
            Ok(())
        })
        .await
    }

    /// Frees `slot` on `date`; releasing the last slot of a date removes the
    /// date entirely. Releasing an unbooked slot is a no-op.
    pub async fn release_slot(
        &self,
        id: ObjectId,
        date: &str,
        slot: &str,
    ) -> Result<SlotsBooked, DbError> {
        self.modify_slots(id, |_, slots| {
            slots.release(date, slot);
            Ok(())
        })
        .await
    }

    async fn modify_slots<F>(&self, id: ObjectId, mut change: F) -> Result<SlotsBooked, DbError>
    where
        F: FnMut(&Doctor, &mut SlotsBooked) -> Result<(), DbError>,
    {
        for _ in 0..BOOKING_ATTEMPTS {
            let doctor = self.find_by_id(id).await?.ok_or_else(|| not_found(id))?;
            let mut slots = doctor.slots_booked.clone();
            change(&doctor, &mut slots)?;
            if slots == doctor.slots_booked {
                return Ok(slots);
            }

            if self.write_slots(&doctor, &slots).await? {
                return Ok(slots);
            }
            tracing::debug!(doctor = %id, "slot update raced, retrying");
        }

        Err(DbError::Store(format!(
            "slot update for doctor {id} kept conflicting with concurrent writes"
        )))
    }

    /// Replaces the slot map only if nobody wrote it since `read` was loaded.
    async fn write_slots(&self, read: &Doctor, slots: &SlotsBooked) -> Result<bool, DbError> {
        // A record that was never booked has no counter yet.
        let version = match read.slots_version {
            0 => Bson::Null,
            n => Bson::Int64(n),
        };
        let mut guard = doc! { "_id": read.oid };
        guard.insert(SLOTS_VERSION, version);

        self.accessor
            .update_one_counted(
                guard,
                doc! { "slots_booked": slots.to_document() },
                SLOTS_VERSION,
            )
            .await
    }

    async fn update(&self, id: ObjectId, set: Document) -> Result<(), DbError> {
        if self.accessor.update_one(doc! { "_id": id }, set).await? {
            Ok(())
        } else {
            Err(not_found(id))
        }
    }
}

fn not_found(id: ObjectId) -> DbError {
    DbError::NotFound {
        collection: crate::schema::DOCTORS_COLLECTION.to_string(),
        id: id.to_hex(),
    }
}

fn decode(doc: Document) -> Result<Doctor, DbError> {
    mongodb::bson::from_document(doc)
        .map_err(|err| DbError::Store(format!("corrupt doctor record: {err}")))
}
