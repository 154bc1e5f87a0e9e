use crate::{
    backend::{BookingBackend, UPCOMING_LIMIT},
    catalog,
    error::BookingError,
    reservation::normalize_phone,
    types::{
        Appointment, AppointmentDetails, AppointmentStatus, BraidStyle, Client, ClientDetails,
        ClientProfile, Color, FinanceEntry, Month, NewFinanceEntry, Reservation, StatusPolicy,
        TimePeriod,
    },
};
use chrono::{NaiveDate, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::watch::{self, Sender};
use tokio_stream::wrappers::WatchStream;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Store {
    clients: HashMap<Uuid, Client>,
    braid_styles: HashMap<Uuid, BraidStyle>,
    colors: HashMap<Uuid, Color>,
    appointments: HashMap<Uuid, Appointment>,
    finance_entries: Vec<FinanceEntry>,
}

impl Store {
    fn details(&self, appointment: &Appointment) -> Result<AppointmentDetails, BookingError> {
        let missing = |what: &str| {
            BookingError::Store(format!("{what} of appointment {} is missing", appointment.id))
        };
        Ok(AppointmentDetails {
            appointment: appointment.clone(),
            client: self
                .clients
                .get(&appointment.client_id)
                .cloned()
                .ok_or_else(|| missing("Client"))?,
            braid_style: self
                .braid_styles
                .get(&appointment.braid_style_id)
                .cloned()
                .ok_or_else(|| missing("Braid style"))?,
            color: self
                .colors
                .get(&appointment.color_id)
                .cloned()
                .ok_or_else(|| missing("Color"))?,
        })
    }

    fn sorted_details(
        &self,
        filter: impl Fn(&Appointment) -> bool,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        let mut appointments: Vec<&Appointment> = self
            .appointments
            .values()
            .filter(|appointment| filter(appointment))
            .collect();
        appointments.sort_by_key(|appointment| appointment.agenda_key());
        appointments
            .into_iter()
            .map(|appointment| self.details(appointment))
            .collect()
    }

    /// The active appointment holding a slot, ignoring `except`.
    fn slot_holder(
        &self,
        date: NaiveDate,
        time_period: TimePeriod,
        except: Option<Uuid>,
    ) -> Option<&Appointment> {
        self.appointments.values().find(|appointment| {
            appointment.date == date
                && appointment.time_period == time_period
                && appointment.status.is_active()
                && Some(appointment.id) != except
        })
    }

    fn client_by_phone(&self, phone_digits: &str) -> Option<&Client> {
        self.clients
            .values()
            .find(|client| normalize_phone(&client.phone) == phone_digits)
    }

    fn upsert_client(&mut self, details: ClientDetails) -> Client {
        let digits = normalize_phone(&details.phone);
        let id = self
            .client_by_phone(&digits)
            .map(|client| client.id)
            .unwrap_or_else(Uuid::new_v4);
        let client = Client {
            id,
            name: details.name,
            phone: details.phone,
            email: details.email,
            address: details.address,
        };
        self.clients.insert(id, client.clone());
        client
    }
}

/// In-memory store used when no database is configured. Every operation runs
/// under one lock, which makes each of them atomic.
#[derive(Debug, Clone)]
pub struct LocalBookings {
    store: Arc<Mutex<Store>>,
    sender: Arc<Sender<Vec<AppointmentDetails>>>,
}

impl Default for LocalBookings {
    fn default() -> Self {
        let (sender, _) = watch::channel(vec![]);
        Self {
            store: Arc::new(Mutex::default()),
            sender: Arc::new(sender),
        }
    }
}

impl LocalBookings {
    pub fn with_default_catalog() -> Self {
        let bookings = Self::default();
        if let Ok(mut store) = bookings.store() {
            for style in catalog::default_braid_styles() {
                store.braid_styles.insert(style.id, style);
            }
            for color in catalog::default_colors() {
                store.colors.insert(color.id, color);
            }
        }
        bookings
    }

    fn store(&self) -> Result<MutexGuard<'_, Store>, BookingError> {
        self.store
            .lock()
            .map_err(|_| BookingError::Store("Local store lock poisoned".into()))
    }

    /// Must run under the same guard as the write it reports, so that
    /// publications keep the order of the writes.
    fn send_open_appointments(&self, store: &Store) {
        match store.sorted_details(|appointment| appointment.status.is_open()) {
            Ok(open) => {
                self.sender.send_replace(open);
            }
            Err(err) => error!(%err, "Failed to send open appointments"),
        }
    }
}

impl BookingBackend for LocalBookings {
    fn open_appointments_stream(&self) -> WatchStream<Vec<AppointmentDetails>> {
        let stream = WatchStream::new(self.sender.subscribe());
        match self.store() {
            Ok(store) => self.send_open_appointments(&store),
            Err(err) => error!(%err, "Failed to send open appointments"),
        }
        stream
    }

    fn occupied_periods(&self, date: NaiveDate) -> Result<BTreeSet<TimePeriod>, BookingError> {
        Ok(self
            .store()?
            .appointments
            .values()
            .filter(|appointment| appointment.date == date && appointment.status.is_active())
            .map(|appointment| appointment.time_period)
            .collect())
    }

    fn reserve(&self, reservation: Reservation) -> Result<AppointmentDetails, BookingError> {
        let details = {
            let mut store = self.store()?;

            if store
                .slot_holder(reservation.date, reservation.time_period, None)
                .is_some()
            {
                info!(
                    date = %reservation.date,
                    period = %reservation.time_period,
                    "Slot already taken"
                );
                return Err(BookingError::Conflict);
            }
            if !store.braid_styles.contains_key(&reservation.braid_style_id) {
                return Err(BookingError::NotFound(format!(
                    "Braid style {} not found",
                    reservation.braid_style_id
                )));
            }
            if !store.colors.contains_key(&reservation.color_id) {
                return Err(BookingError::NotFound(format!(
                    "Color {} not found",
                    reservation.color_id
                )));
            }

            let client = store.upsert_client(reservation.client);
            let appointment = Appointment {
                id: Uuid::new_v4(),
                date: reservation.date,
                time_period: reservation.time_period,
                status: AppointmentStatus::Pending,
                notes: reservation.notes,
                client_id: client.id,
                braid_style_id: reservation.braid_style_id,
                color_id: reservation.color_id,
                created_at: Utc::now(),
            };
            store.appointments.insert(appointment.id, appointment.clone());
            let details = store.details(&appointment)?;
            self.send_open_appointments(&store);
            details
        };
        info!(
            id = %details.appointment.id,
            date = %details.appointment.date,
            period = %details.appointment.time_period,
            "Slot reserved"
        );
        Ok(details)
    }

    fn update_status(
        &self,
        id: Uuid,
        status: AppointmentStatus,
        policy: StatusPolicy,
    ) -> Result<AppointmentDetails, BookingError> {
        let details = {
            let mut store = self.store()?;
            let mut appointment = store
                .appointments
                .get(&id)
                .cloned()
                .ok_or_else(|| BookingError::NotFound(format!("Appointment {id} not found")))?;
            policy.check(appointment.status, status)?;

            if status.is_active()
                && !appointment.status.is_active()
                && store
                    .slot_holder(appointment.date, appointment.time_period, Some(id))
                    .is_some()
            {
                return Err(BookingError::Conflict);
            }

            appointment.status = status;
            store.appointments.insert(id, appointment.clone());
            let details = store.details(&appointment)?;
            self.send_open_appointments(&store);
            details
        };
        info!(%id, %status, "Appointment status updated");
        Ok(details)
    }

    fn appointments(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        self.store()?
            .sorted_details(|appointment| date.map_or(true, |date| appointment.date == date))
    }

    fn upcoming_appointments(
        &self,
        from: NaiveDate,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        let mut upcoming = self.store()?.sorted_details(|appointment| {
            appointment.date >= from && appointment.status.is_open()
        })?;
        upcoming.truncate(UPCOMING_LIMIT);
        Ok(upcoming)
    }

    fn find_client_by_phone(&self, phone_digits: &str) -> Result<Option<Client>, BookingError> {
        Ok(self.store()?.client_by_phone(phone_digits).cloned())
    }

    fn clients(&self, search: Option<&str>) -> Result<Vec<Client>, BookingError> {
        let needle = search.map(str::to_lowercase);
        let mut clients: Vec<Client> = self
            .store()?
            .clients
            .values()
            .filter(|client| match &needle {
                Some(needle) => [&client.name, &client.email, &client.phone]
                    .iter()
                    .any(|field| field.to_lowercase().contains(needle.as_str())),
                None => true,
            })
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }

    fn client_profile(&self, id: Uuid) -> Result<ClientProfile, BookingError> {
        let store = self.store()?;
        let client = store
            .clients
            .get(&id)
            .cloned()
            .ok_or_else(|| BookingError::NotFound(format!("Client {id} not found")))?;
        let mut appointments = store.sorted_details(|appointment| appointment.client_id == id)?;
        appointments.reverse();
        Ok(ClientProfile {
            client,
            appointments,
        })
    }

    fn braid_styles(&self) -> Result<Vec<BraidStyle>, BookingError> {
        let mut styles: Vec<BraidStyle> = self.store()?.braid_styles.values().cloned().collect();
        styles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(styles)
    }

    fn colors(&self) -> Result<Vec<Color>, BookingError> {
        let mut colors: Vec<Color> = self.store()?.colors.values().cloned().collect();
        colors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(colors)
    }

    fn finance_entries(&self, month: Option<Month>) -> Result<Vec<FinanceEntry>, BookingError> {
        let mut entries: Vec<FinanceEntry> = self
            .store()?
            .finance_entries
            .iter()
            .filter(|entry| month.map_or(true, |month| month.contains(entry.date)))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.date.cmp(&a.date).then(b.created_at.cmp(&a.created_at)));
        Ok(entries)
    }

    fn add_finance_entry(&self, entry: NewFinanceEntry) -> Result<FinanceEntry, BookingError> {
        let entry = FinanceEntry {
            id: Uuid::new_v4(),
            kind: entry.kind,
            amount: entry.kind.signed_amount(entry.amount),
            description: entry.description,
            date: entry.date,
            category: entry.category,
            created_at: Utc::now(),
        };
        self.store()?.finance_entries.push(entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{testutils::example_reservation, types::FinanceKind};
    use futures::StreamExt;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn reservation(
        bookings: &LocalBookings,
        date: NaiveDate,
        time_period: TimePeriod,
        phone: &str,
        name: &str,
    ) -> Reservation {
        let style = bookings.braid_styles().unwrap()[0].id;
        let color = bookings.colors().unwrap()[0].id;
        example_reservation(style, color, date, time_period, phone, name)
    }

    #[test]
    fn test_reserve_cancel_and_rebook_single_slot() {
        let bookings = LocalBookings::with_default_catalog();
        assert!(bookings.occupied_periods(date(10)).unwrap().is_empty());

        let first = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Afternoon,
                "(11) 91234-5678",
                "Ana",
            ))
            .unwrap();
        assert_eq!(first.appointment.status, AppointmentStatus::Pending);
        assert_eq!(first.client.name, "Ana");
        assert_eq!(
            bookings.occupied_periods(date(10)).unwrap(),
            BTreeSet::from([TimePeriod::Afternoon])
        );

        let err = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Afternoon,
                "(11) 97777-0000",
                "Bia",
            ))
            .unwrap_err();
        assert!(matches!(err, BookingError::Conflict));
        assert_eq!(bookings.clients(None).unwrap().len(), 1);

        bookings
            .update_status(
                first.appointment.id,
                AppointmentStatus::Cancelled,
                StatusPolicy::default(),
            )
            .unwrap();
        assert!(bookings.occupied_periods(date(10)).unwrap().is_empty());

        bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Afternoon,
                "(11) 97777-0000",
                "Bia",
            ))
            .unwrap();
        assert_eq!(bookings.appointments(Some(date(10))).unwrap().len(), 2);
    }

    #[test]
    fn test_other_periods_and_days_stay_free() {
        let bookings = LocalBookings::with_default_catalog();
        bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(11) 91234-5678",
                "Ana",
            ))
            .unwrap();
        bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Evening,
                "(11) 91234-5678",
                "Ana",
            ))
            .unwrap();
        bookings
            .reserve(reservation(
                &bookings,
                date(11),
                TimePeriod::Morning,
                "(11) 91234-5678",
                "Ana",
            ))
            .unwrap();

        assert_eq!(
            bookings.occupied_periods(date(10)).unwrap(),
            BTreeSet::from([TimePeriod::Morning, TimePeriod::Evening])
        );
        assert_eq!(
            bookings.occupied_periods(date(11)).unwrap(),
            BTreeSet::from([TimePeriod::Morning])
        );
    }

    #[test]
    fn test_concurrent_reservations_for_one_slot() {
        let bookings = LocalBookings::with_default_catalog();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bookings = bookings.clone();
                let phone = format!("(11) 9{:04}-0000", 1000 + i);
                let reservation =
                    reservation(&bookings, date(10), TimePeriod::Afternoon, &phone, "Racer");
                std::thread::spawn(move || bookings.reserve(reservation))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|result| result.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|result| matches!(result, Err(BookingError::Conflict)))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(bookings.appointments(None).unwrap().len(), 1);
        assert_eq!(bookings.clients(None).unwrap().len(), 1);
    }

    #[test]
    fn test_published_agenda_matches_concurrent_writes() {
        let slots: Vec<_> = (10..14)
            .flat_map(|day| [TimePeriod::Morning, TimePeriod::Evening].map(|period| (day, period)))
            .collect();

        for _ in 0..50 {
            let bookings = LocalBookings::with_default_catalog();
            let handles: Vec<_> = slots
                .iter()
                .enumerate()
                .map(|(index, (day, period))| {
                    let bookings = bookings.clone();
                    let phone = format!("1191234560{index}");
                    let reservation = reservation(&bookings, date(*day), *period, &phone, "Writer");
                    std::thread::spawn(move || bookings.reserve(reservation).unwrap())
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let published = bookings.sender.borrow().clone();
            assert_eq!(published.len(), slots.len());
            assert_eq!(published, bookings.appointments(None).unwrap());
        }
    }

    #[test]
    fn test_same_phone_different_formatting_updates_client() {
        let bookings = LocalBookings::with_default_catalog();
        let first = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        let second = bookings
            .reserve(reservation(
                &bookings,
                date(12),
                TimePeriod::Morning,
                "21 98888 1111",
                "Ana Maria",
            ))
            .unwrap();

        assert_eq!(first.client.id, second.client.id);
        let clients = bookings.clients(None).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Ana Maria");

        let found = bookings.find_client_by_phone("21988881111").unwrap().unwrap();
        assert_eq!(found.id, first.client.id);
        assert!(bookings.find_client_by_phone("21900000000").unwrap().is_none());
    }

    #[test]
    fn test_unknown_style_or_color_creates_nothing() {
        let bookings = LocalBookings::with_default_catalog();
        let mut unknown_style =
            reservation(&bookings, date(10), TimePeriod::Morning, "(21) 98888-1111", "Ana");
        unknown_style.braid_style_id = Uuid::new_v4();
        let err = bookings.reserve(unknown_style).unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));

        let mut unknown_color =
            reservation(&bookings, date(10), TimePeriod::Morning, "(21) 98888-1111", "Ana");
        unknown_color.color_id = Uuid::new_v4();
        let err = bookings.reserve(unknown_color).unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));

        assert!(bookings.clients(None).unwrap().is_empty());
        assert!(bookings.appointments(None).unwrap().is_empty());
    }

    #[test]
    fn test_status_policies() {
        let bookings = LocalBookings::with_default_catalog();
        let id = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap()
            .appointment
            .id;

        let err = bookings
            .update_status(id, AppointmentStatus::Completed, StatusPolicy::Lifecycle)
            .unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        bookings
            .update_status(id, AppointmentStatus::Confirmed, StatusPolicy::Lifecycle)
            .unwrap();
        bookings
            .update_status(id, AppointmentStatus::Completed, StatusPolicy::Lifecycle)
            .unwrap();
        let reopened = bookings
            .update_status(id, AppointmentStatus::Pending, StatusPolicy::Unrestricted)
            .unwrap();
        assert_eq!(reopened.appointment.status, AppointmentStatus::Pending);

        let err = bookings
            .update_status(Uuid::new_v4(), AppointmentStatus::Cancelled, StatusPolicy::Unrestricted)
            .unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));
    }

    #[test]
    fn test_reactivating_cancelled_appointment_on_taken_slot() {
        let bookings = LocalBookings::with_default_catalog();
        let first = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        bookings
            .update_status(
                first.appointment.id,
                AppointmentStatus::Cancelled,
                StatusPolicy::Unrestricted,
            )
            .unwrap();
        bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(11) 91234-5678",
                "Bia",
            ))
            .unwrap();

        let err = bookings
            .update_status(
                first.appointment.id,
                AppointmentStatus::Pending,
                StatusPolicy::Unrestricted,
            )
            .unwrap_err();
        assert!(matches!(err, BookingError::Conflict));
    }

    #[test]
    fn test_upcoming_and_client_profile() {
        let bookings = LocalBookings::with_default_catalog();
        let past = bookings
            .reserve(reservation(&bookings, date(2), TimePeriod::Morning, "(21) 98888-1111", "Ana"))
            .unwrap();
        let later = bookings
            .reserve(reservation(
                &bookings,
                date(20),
                TimePeriod::Evening,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        let sooner = bookings
            .reserve(reservation(
                &bookings,
                date(12),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        let cancelled = bookings
            .reserve(reservation(
                &bookings,
                date(15),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        bookings
            .update_status(
                cancelled.appointment.id,
                AppointmentStatus::Cancelled,
                StatusPolicy::Unrestricted,
            )
            .unwrap();

        let upcoming: Vec<Uuid> = bookings
            .upcoming_appointments(date(5))
            .unwrap()
            .into_iter()
            .map(|details| details.appointment.id)
            .collect();
        assert_eq!(upcoming, vec![sooner.appointment.id, later.appointment.id]);

        let profile = bookings.client_profile(past.client.id).unwrap();
        assert_eq!(profile.appointments.len(), 4);
        assert_eq!(profile.appointments[0].appointment.id, later.appointment.id);
        assert_eq!(profile.appointments[3].appointment.id, past.appointment.id);

        bookings.client_profile(Uuid::new_v4()).unwrap_err();
    }

    #[test]
    fn test_client_search() {
        let bookings = LocalBookings::with_default_catalog();
        bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Carla",
            ))
            .unwrap();
        bookings
            .reserve(reservation(
                &bookings,
                date(11),
                TimePeriod::Morning,
                "(11) 91234-5678",
                "Ana",
            ))
            .unwrap();

        let names: Vec<String> = bookings
            .clients(None)
            .unwrap()
            .into_iter()
            .map(|client| client.name)
            .collect();
        assert_eq!(names, vec!["Ana", "Carla"]);

        let found = bookings.clients(Some("carl")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Carla");
        assert_eq!(bookings.clients(Some("98888")).unwrap().len(), 1);
        assert!(bookings.clients(Some("nobody")).unwrap().is_empty());
    }

    #[test]
    fn test_finance_entries() {
        let bookings = LocalBookings::default();
        let income = bookings
            .add_finance_entry(NewFinanceEntry {
                kind: FinanceKind::Income,
                amount: 150.0,
                description: "Box braids".into(),
                date: date(10),
                category: None,
            })
            .unwrap();
        let expense = bookings
            .add_finance_entry(NewFinanceEntry {
                kind: FinanceKind::Expense,
                amount: 40.0,
                description: "Hair extensions".into(),
                date: date(12),
                category: Some("supplies".into()),
            })
            .unwrap();
        assert_eq!(income.amount, 150.0);
        assert_eq!(expense.amount, -40.0);

        let june = bookings
            .finance_entries(Some(Month::new(2025, 6).unwrap()))
            .unwrap();
        assert_eq!(june, vec![expense, income]);
        assert!(bookings
            .finance_entries(Some(Month::new(2025, 7).unwrap()))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_open_appointments_stream() {
        let bookings = LocalBookings::with_default_catalog();
        let mut stream = bookings.open_appointments_stream();
        assert!(stream.next().await.unwrap().is_empty());

        let details = bookings
            .reserve(reservation(
                &bookings,
                date(10),
                TimePeriod::Morning,
                "(21) 98888-1111",
                "Ana",
            ))
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), vec![details.clone()]);

        bookings
            .update_status(
                details.appointment.id,
                AppointmentStatus::Cancelled,
                StatusPolicy::Unrestricted,
            )
            .unwrap();
        assert!(stream.next().await.unwrap().is_empty());
    }
}
