//! Diesel row structs and their conversion into the API types.

use crate::{
    error::BookingError,
    reservation::normalize_phone,
    schema::{appointments, braid_styles, clients, colors, finance_entries},
    types::{
        Address, Appointment, AppointmentDetails, BraidStyle, Client, ClientDetails, Color,
        FinanceEntry,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = clients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ClientRow {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub cep: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            address: Address {
                cep: row.cep,
                street: row.street,
                number: row.number,
                complement: row.complement,
                district: row.district,
                city: row.city,
                state: row.state,
            },
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = clients)]
pub struct NewClientRow<'a> {
    pub id: Uuid,
    pub name: &'a str,
    pub phone: &'a str,
    pub phone_digits: String,
    pub email: &'a str,
    pub cep: Option<&'a str>,
    pub street: Option<&'a str>,
    pub number: Option<&'a str>,
    pub complement: Option<&'a str>,
    pub district: Option<&'a str>,
    pub city: Option<&'a str>,
    pub state: Option<&'a str>,
}

/// Fields a returning client overwrites. Missing address parts are cleared.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = clients)]
#[diesel(treat_none_as_null = true)]
pub struct ClientChangeset<'a> {
    pub name: &'a str,
    pub phone: &'a str,
    pub email: &'a str,
    pub cep: Option<&'a str>,
    pub street: Option<&'a str>,
    pub number: Option<&'a str>,
    pub complement: Option<&'a str>,
    pub district: Option<&'a str>,
    pub city: Option<&'a str>,
    pub state: Option<&'a str>,
}

impl<'a> NewClientRow<'a> {
    pub fn new(details: &'a ClientDetails) -> Self {
        let address = &details.address;
        Self {
            id: Uuid::new_v4(),
            name: &details.name,
            phone: &details.phone,
            phone_digits: normalize_phone(&details.phone),
            email: &details.email,
            cep: address.cep.as_deref(),
            street: address.street.as_deref(),
            number: address.number.as_deref(),
            complement: address.complement.as_deref(),
            district: address.district.as_deref(),
            city: address.city.as_deref(),
            state: address.state.as_deref(),
        }
    }

    pub fn changeset(&self) -> ClientChangeset<'a> {
        ClientChangeset {
            name: self.name,
            phone: self.phone,
            email: self.email,
            cep: self.cep,
            street: self.street,
            number: self.number,
            complement: self.complement,
            district: self.district,
            city: self.city,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = braid_styles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BraidStyleRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub base_price: f64,
    pub estimated_duration: i32,
}

impl From<BraidStyleRow> for BraidStyle {
    fn from(row: BraidStyleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            base_price: row.base_price,
            estimated_duration: row.estimated_duration,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = colors)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ColorRow {
    pub id: Uuid,
    pub name: String,
    pub hex_code: String,
}

impl From<ColorRow> for Color {
    fn from(row: ColorRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            hex_code: row.hex_code,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = appointments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AppointmentRow {
    pub id: Uuid,
    pub date: NaiveDate,
    pub time_period: String,
    pub status: String,
    pub notes: Option<String>,
    pub client_id: Uuid,
    pub braid_style_id: Uuid,
    pub color_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = BookingError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt =
            |err: BookingError| BookingError::Store(format!("Appointment {id} is corrupt: {err}"));
        Ok(Self {
            id: row.id,
            date: row.date,
            time_period: row.time_period.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            notes: row.notes,
            client_id: row.client_id,
            braid_style_id: row.braid_style_id,
            color_id: row.color_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = appointments)]
pub struct NewAppointmentRow<'a> {
    pub id: Uuid,
    pub date: NaiveDate,
    pub time_period: &'a str,
    pub status: &'a str,
    pub notes: Option<&'a str>,
    pub client_id: Uuid,
    pub braid_style_id: Uuid,
    pub color_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Shape of the four-way join used to load appointment details.
pub type DetailsRow = (AppointmentRow, ClientRow, BraidStyleRow, ColorRow);

pub fn into_details(row: DetailsRow) -> Result<AppointmentDetails, BookingError> {
    let (appointment, client, braid_style, color) = row;
    Ok(AppointmentDetails {
        appointment: appointment.try_into()?,
        client: client.into(),
        braid_style: braid_style.into(),
        color: color.into(),
    })
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = finance_entries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FinanceEntryRow {
    pub id: Uuid,
    pub kind: String,
    pub amount: f64,
    pub description: String,
    pub date: NaiveDate,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<FinanceEntryRow> for FinanceEntry {
    type Error = BookingError;

    fn try_from(row: FinanceEntryRow) -> Result<Self, Self::Error> {
        let id = row.id;
        Ok(Self {
            id,
            kind: row.kind.parse().map_err(|err: BookingError| {
                BookingError::Store(format!("Finance entry {id} is corrupt: {err}"))
            })?,
            amount: row.amount,
            description: row.description,
            date: row.date,
            category: row.category,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = finance_entries)]
pub struct NewFinanceEntryRow<'a> {
    pub id: Uuid,
    pub kind: &'a str,
    pub amount: f64,
    pub description: &'a str,
    pub date: NaiveDate,
    pub category: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}
