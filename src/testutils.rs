use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::{NaiveDate, Utc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::{
    backend::BookingBackend,
    clock::MockClock,
    configuration::Configuration,
    error::BookingError,
    http::create_app,
    types::{
        Address, Appointment, AppointmentDetails, AppointmentStatus, BraidStyle, Client,
        ClientDetails, ClientProfile, Color, FinanceEntry, Month, NewFinanceEntry,
        Reservation, StatusPolicy, TimePeriod,
    },
};

pub const TEST_PASSWORD: &str = "123";

#[derive(Clone)]
pub struct TestConfiguration {
    pub frontend_path: PathBuf,
    pub status_policy: StatusPolicy,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            frontend_path: PathBuf::from("does/not/exist.html"),
            status_policy: StatusPolicy::Unrestricted,
        }
    }
}

impl Configuration for TestConfiguration {
    fn website_title(&self) -> String {
        "Test Studio".into()
    }

    fn password(&self) -> String {
        TEST_PASSWORD.into()
    }

    fn frontend_path(&self) -> PathBuf {
        self.frontend_path.clone()
    }

    fn database_url(&self) -> Option<String> {
        None
    }

    fn port(&self) -> String {
        "0".into()
    }

    fn status_policy(&self) -> StatusPolicy {
        self.status_policy
    }
}

/// Serves the app on an ephemeral port with `today` pinned.
/// Returns the server task and its base URL.
pub async fn spawn_app<T: BookingBackend>(
    backend: T,
    configuration: TestConfiguration,
    today: NaiveDate,
) -> (JoinHandle<()>, String) {
    let mut clock = MockClock::new();
    clock.expect_today().return_const(today);
    let app = create_app(backend, configuration, Arc::new(clock));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, base_url)
}

pub fn example_reservation(
    braid_style_id: Uuid,
    color_id: Uuid,
    date: NaiveDate,
    time_period: TimePeriod,
    phone: &str,
    name: &str,
) -> Reservation {
    Reservation {
        date,
        time_period,
        client: ClientDetails {
            name: name.into(),
            phone: phone.into(),
            email: "client@example.com".into(),
            address: Address::default(),
        },
        braid_style_id,
        color_id,
        notes: None,
    }
}

pub fn example_details(date: NaiveDate, time_period: TimePeriod) -> AppointmentDetails {
    let client = Client {
        id: Uuid::new_v4(),
        name: "Ana".into(),
        phone: "(11) 91234-5678".into(),
        email: "ana@example.com".into(),
        address: Address::default(),
    };
    let braid_style = BraidStyle {
        id: Uuid::new_v4(),
        name: "Box Braids".into(),
        description: None,
        base_price: 150.0,
        estimated_duration: 240,
    };
    let color = Color {
        id: Uuid::new_v4(),
        name: "Black".into(),
        hex_code: "#1a1a1a".into(),
    };
    AppointmentDetails {
        appointment: Appointment {
            id: Uuid::new_v4(),
            date,
            time_period,
            status: AppointmentStatus::Pending,
            notes: None,
            client_id: client.id,
            braid_style_id: braid_style.id,
            color_id: color.id,
            created_at: Utc::now(),
        },
        client,
        braid_style,
        color,
    }
}

pub struct MockBookingBackendInner {
    pub success: AtomicBool,
    pub calls_to_occupied_periods: AtomicU64,
    pub calls_to_reserve: AtomicU64,
    pub calls_to_update_status: AtomicU64,
    pub calls_to_appointments: AtomicU64,
    pub calls_to_upcoming_appointments: AtomicU64,
    pub calls_to_find_client_by_phone: AtomicU64,
    pub calls_to_clients: AtomicU64,
    pub calls_to_client_profile: AtomicU64,
    pub calls_to_catalog: AtomicU64,
    pub calls_to_finance_entries: AtomicU64,
    pub calls_to_add_finance_entry: AtomicU64,
    pub occupied: Mutex<BTreeSet<TimePeriod>>,
    sender: watch::Sender<Vec<AppointmentDetails>>,
}

/// Counts backend calls and fails all of them while `success` is false.
#[derive(Clone)]
pub struct MockBookingBackend(pub Arc<MockBookingBackendInner>);

impl MockBookingBackendInner {
    fn new() -> Self {
        let (sender, _) = watch::channel(vec![]);
        Self {
            success: AtomicBool::new(true),
            calls_to_occupied_periods: AtomicU64::default(),
            calls_to_reserve: AtomicU64::default(),
            calls_to_update_status: AtomicU64::default(),
            calls_to_appointments: AtomicU64::default(),
            calls_to_upcoming_appointments: AtomicU64::default(),
            calls_to_find_client_by_phone: AtomicU64::default(),
            calls_to_clients: AtomicU64::default(),
            calls_to_client_profile: AtomicU64::default(),
            calls_to_catalog: AtomicU64::default(),
            calls_to_finance_entries: AtomicU64::default(),
            calls_to_add_finance_entry: AtomicU64::default(),
            occupied: Mutex::default(),
            sender,
        }
    }
}

impl Default for MockBookingBackend {
    fn default() -> Self {
        Self(Arc::new(MockBookingBackendInner::new()))
    }
}

impl MockBookingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn record<R>(&self, counter: &AtomicU64, value: impl FnOnce() -> R) -> Result<R, BookingError> {
        counter.fetch_add(1, Ordering::SeqCst);
        match self.0.success.load(Ordering::SeqCst) {
            true => Ok(value()),
            false => Err(BookingError::Store("Supposed to fail".into())),
        }
    }
}

impl BookingBackend for MockBookingBackend {
    fn open_appointments_stream(&self) -> WatchStream<Vec<AppointmentDetails>> {
        WatchStream::new(self.0.sender.subscribe())
    }

    fn occupied_periods(&self, _date: NaiveDate) -> Result<BTreeSet<TimePeriod>, BookingError> {
        self.record(&self.0.calls_to_occupied_periods, || {
            self.0.occupied.lock().unwrap().clone()
        })
    }

    fn reserve(&self, reservation: Reservation) -> Result<AppointmentDetails, BookingError> {
        self.record(&self.0.calls_to_reserve, || {
            example_details(reservation.date, reservation.time_period)
        })
    }

    fn update_status(
        &self,
        id: Uuid,
        status: AppointmentStatus,
        _policy: StatusPolicy,
    ) -> Result<AppointmentDetails, BookingError> {
        self.record(&self.0.calls_to_update_status, || {
            let mut details = example_details(Utc::now().date_naive(), TimePeriod::Morning);
            details.appointment.id = id;
            details.appointment.status = status;
            details
        })
    }

    fn appointments(
        &self,
        _date: Option<NaiveDate>,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        self.record(&self.0.calls_to_appointments, Vec::new)
    }

    fn upcoming_appointments(
        &self,
        _from: NaiveDate,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        self.record(&self.0.calls_to_upcoming_appointments, Vec::new)
    }

    fn find_client_by_phone(&self, _phone_digits: &str) -> Result<Option<Client>, BookingError> {
        self.record(&self.0.calls_to_find_client_by_phone, || None)
    }

    fn clients(&self, _search: Option<&str>) -> Result<Vec<Client>, BookingError> {
        self.record(&self.0.calls_to_clients, Vec::new)
    }

    fn client_profile(&self, id: Uuid) -> Result<ClientProfile, BookingError> {
        self.record(&self.0.calls_to_client_profile, || {
            let mut client = example_details(Utc::now().date_naive(), TimePeriod::Morning).client;
            client.id = id;
            ClientProfile {
                client,
                appointments: vec![],
            }
        })
    }

    fn braid_styles(&self) -> Result<Vec<BraidStyle>, BookingError> {
        self.record(&self.0.calls_to_catalog, Vec::new)
    }

    fn colors(&self) -> Result<Vec<Color>, BookingError> {
        self.record(&self.0.calls_to_catalog, Vec::new)
    }

    fn finance_entries(&self, _month: Option<Month>) -> Result<Vec<FinanceEntry>, BookingError> {
        self.record(&self.0.calls_to_finance_entries, Vec::new)
    }

    fn add_finance_entry(&self, entry: NewFinanceEntry) -> Result<FinanceEntry, BookingError> {
        self.record(&self.0.calls_to_add_finance_entry, || FinanceEntry {
            id: Uuid::new_v4(),
            kind: entry.kind,
            amount: entry.kind.signed_amount(entry.amount),
            description: entry.description,
            date: entry.date,
            category: entry.category,
            created_at: Utc::now(),
        })
    }
}
