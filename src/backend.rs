use crate::error::BookingError;
use crate::types::{
    AppointmentDetails, AppointmentStatus, BraidStyle, Client, ClientProfile, Color, FinanceEntry,
    Month, NewFinanceEntry, Reservation, StatusPolicy, TimePeriod,
};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

/// Number of appointments returned by the upcoming agenda.
pub const UPCOMING_LIMIT: usize = 10;

pub trait BookingBackend: Clone + Send + Sync + 'static {
    /// Emits the open (pending or confirmed) appointments after every change.
    fn open_appointments_stream(&self) -> WatchStream<Vec<AppointmentDetails>>;

    /// Time periods held on `date` by appointments that are not cancelled.
    fn occupied_periods(&self, date: NaiveDate) -> Result<BTreeSet<TimePeriod>, BookingError>;

    /// Grants the slot to a new pending appointment unless an active one holds it.
    /// The occupancy check, client upsert and insert form one atomic unit.
    fn reserve(&self, reservation: Reservation) -> Result<AppointmentDetails, BookingError>;

    fn update_status(
        &self,
        id: Uuid,
        status: AppointmentStatus,
        policy: StatusPolicy,
    ) -> Result<AppointmentDetails, BookingError>;

    /// All appointments, optionally restricted to one day, ordered by date and period.
    fn appointments(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AppointmentDetails>, BookingError>;

    /// Open appointments from `from` onwards, at most `UPCOMING_LIMIT`.
    fn upcoming_appointments(
        &self,
        from: NaiveDate,
    ) -> Result<Vec<AppointmentDetails>, BookingError>;

    fn find_client_by_phone(&self, phone_digits: &str) -> Result<Option<Client>, BookingError>;
    fn clients(&self, search: Option<&str>) -> Result<Vec<Client>, BookingError>;
    fn client_profile(&self, id: Uuid) -> Result<ClientProfile, BookingError>;

    fn braid_styles(&self) -> Result<Vec<BraidStyle>, BookingError>;
    fn colors(&self) -> Result<Vec<Color>, BookingError>;

    fn finance_entries(&self, month: Option<Month>) -> Result<Vec<FinanceEntry>, BookingError>;
    fn add_finance_entry(&self, entry: NewFinanceEntry) -> Result<FinanceEntry, BookingError>;
}
