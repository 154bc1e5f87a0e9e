//! Input side of the booking flow.
//!
//! Everything here runs before the store is touched: a request that leaves
//! this module as a [`Reservation`] is well-formed and inside the booking
//! window. Whether its slot is still free is decided by the backend.

use crate::{
    error::BookingError,
    types::{Address, ClientDetails, Reservation, TimePeriod},
};
use chrono::{Days, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

/// Bookings open the day after today.
pub const MIN_DAYS_AHEAD: u64 = 1;
/// And close this many days out, inclusive.
pub const MAX_DAYS_AHEAD: u64 = 60;

/// Minimum digits before a phone lookup is attempted.
pub const MIN_LOOKUP_DIGITS: usize = 10;

const MIN_NAME_CHARACTERS: usize = 2;

lazy_static! {
    /// Area code, mobile marker `9`, eight digits.
    static ref MOBILE_DIGITS: Regex = Regex::new(r"^\d{2}9\d{8}$").unwrap();
    static ref PHONE_CHARACTERS: Regex = Regex::new(r"^[\d\s()+\-.]+$").unwrap();
}

pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Formats a valid mobile number as `(XX) 9XXXX-XXXX`.
pub fn format_phone(digits: &str) -> String {
    format!("({}) {}-{}", &digits[..2], &digits[2..7], &digits[7..])
}

pub fn is_valid_phone(phone: &str) -> bool {
    PHONE_CHARACTERS.is_match(phone) && MOBILE_DIGITS.is_match(&normalize_phone(phone))
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if is_valid_phone(phone) {
        return Ok(());
    }
    Err(ValidationError::new("phone").with_message(Cow::from(
        "Invalid phone number. Use area code + 9 digits: (XX) 9XXXX-XXXX",
    )))
}

/// Counts characters after trimming, so padding can't satisfy the minimum.
fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().chars().count() >= MIN_NAME_CHARACTERS {
        return Ok(());
    }
    Err(ValidationError::new("name")
        .with_message(Cow::from("Name must have at least 2 characters")))
}

pub fn parse_date(value: &str) -> Result<NaiveDate, BookingError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        BookingError::Validation(format!("Invalid date '{value}', expected YYYY-MM-DD"))
    })
}

/// Checks that `date` lies between tomorrow and `MAX_DAYS_AHEAD` days from `today`.
pub fn check_booking_window(date: NaiveDate, today: NaiveDate) -> Result<(), BookingError> {
    let first = today + Days::new(MIN_DAYS_AHEAD);
    let last = today + Days::new(MAX_DAYS_AHEAD);
    if date < first || date > last {
        return Err(BookingError::Validation(format!(
            "Bookings are accepted from {first} to {last}"
        )));
    }
    Ok(())
}

pub fn parse_id(value: &str, what: &str) -> Result<Uuid, BookingError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| BookingError::Validation(format!("Invalid {what} reference '{value}'")))
}

pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// First human-readable message out of a validator report.
pub fn first_message(errors: &ValidationErrors) -> String {
    errors
        .field_errors()
        .into_iter()
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .and_then(|(field, errors)| {
            errors.first().map(|error| match &error.message {
                Some(message) => message.to_string(),
                None => format!("Invalid value for {field}"),
            })
        })
        .unwrap_or_else(|| "Invalid request".into())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    #[validate(custom(function = "validate_name"))]
    pub client_name: String,
    #[validate(custom(function = "validate_phone"))]
    pub client_phone: String,
    #[validate(email(message = "Invalid email address"))]
    pub client_email: String,
    pub date: String,
    pub time_period: String,
    pub braid_style_id: String,
    pub color_id: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, flatten)]
    pub address: Address,
}

impl ReservationRequest {
    /// Validates the request against the booking rules as of `today`.
    pub fn into_reservation(self, today: NaiveDate) -> Result<Reservation, BookingError> {
        self.validate()
            .map_err(|errors| BookingError::Validation(first_message(&errors)))?;

        let date = parse_date(&self.date)?;
        check_booking_window(date, today)?;
        let time_period: TimePeriod = self.time_period.parse()?;
        let braid_style_id = parse_id(&self.braid_style_id, "braid style")?;
        let color_id = parse_id(&self.color_id, "color")?;

        let address = Address {
            cep: non_empty(self.address.cep),
            street: non_empty(self.address.street),
            number: non_empty(self.address.number),
            complement: non_empty(self.address.complement),
            district: non_empty(self.address.district),
            city: non_empty(self.address.city),
            state: non_empty(self.address.state),
        };

        Ok(Reservation {
            date,
            time_period,
            client: ClientDetails {
                name: self.client_name.trim().to_string(),
                phone: format_phone(&normalize_phone(&self.client_phone)),
                email: self.client_email.trim().to_string(),
                address,
            },
            braid_style_id,
            color_id,
            notes: non_empty(self.notes),
        })
    }
}
