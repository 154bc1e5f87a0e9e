use crate::{
    backend::{BookingBackend, UPCOMING_LIMIT},
    error::BookingError,
    models::{
        into_details, AppointmentRow, BraidStyleRow, ClientRow, ColorRow, DetailsRow,
        FinanceEntryRow, NewAppointmentRow, NewClientRow, NewFinanceEntryRow,
    },
    schema::{appointments, braid_styles, clients, colors, finance_entries},
    types::{
        Appointment, AppointmentDetails, AppointmentStatus, BraidStyle, Client, ClientProfile,
        Color, FinanceEntry, Month, NewFinanceEntry, Reservation, StatusPolicy, TimePeriod,
    },
};
use chrono::{NaiveDate, Utc};
use diesel::{
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
    PgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};
use tokio::sync::watch::{self, Sender};
use tokio_stream::wrappers::WatchStream;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

macro_rules! details_query {
    () => {
        appointments::table
            .inner_join(clients::table)
            .inner_join(braid_styles::table)
            .inner_join(colors::table)
            .select((
                AppointmentRow::as_select(),
                ClientRow::as_select(),
                BraidStyleRow::as_select(),
                ColorRow::as_select(),
            ))
    };
}

#[derive(Clone)]
pub struct DatabaseInterface {
    database_url: String,
    connection: Arc<Mutex<PgConnection>>,
    sender: Arc<Sender<Vec<AppointmentDetails>>>,
}

impl DatabaseInterface {
    /// Connects and applies pending migrations.
    pub fn new(database_url: &str) -> Result<Self, BookingError> {
        let mut connection = Self::establish_connection(database_url)?;
        let applied = connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| BookingError::Store(format!("Failed to run migrations: {err}")))?;
        for version in applied {
            info!(%version, "Applied migration");
        }

        let (sender, _) = watch::channel(vec![]);
        Ok(Self {
            database_url: database_url.into(),
            connection: Arc::new(Mutex::new(connection)),
            sender: Arc::new(sender),
        })
    }

    fn establish_connection(database_url: &str) -> Result<PgConnection, BookingError> {
        PgConnection::establish(database_url)
            .map_err(|err| BookingError::Store(format!("Failed to connect to database: {err}")))
    }

    fn connection(&self) -> Result<MutexGuard<'_, PgConnection>, BookingError> {
        self.connection
            .lock()
            .map_err(|_| BookingError::Store("Database connection lock poisoned".into()))
    }

    fn run<R>(
        &self,
        operation: impl Fn(&mut PgConnection) -> Result<R, BookingError>,
    ) -> Result<R, BookingError> {
        let mut connection = self.connection()?;
        self.run_on(&mut connection, operation)
    }

    /// Runs a write and publishes the open agenda before the connection is
    /// released, so that publications keep the order of the writes.
    fn run_and_publish<R>(
        &self,
        operation: impl Fn(&mut PgConnection) -> Result<R, BookingError>,
    ) -> Result<R, BookingError> {
        let mut connection = self.connection()?;
        let result = self.run_on(&mut connection, operation)?;
        self.send_open_appointments(&mut connection);
        Ok(result)
    }

    /// Runs `operation`, retrying once after a short backoff if it failed
    /// transiently. A dropped connection is re-established first.
    fn run_on<R>(
        &self,
        connection: &mut PgConnection,
        operation: impl Fn(&mut PgConnection) -> Result<R, BookingError>,
    ) -> Result<R, BookingError> {
        match operation(&mut *connection) {
            Err(err) if err.is_transient() => {
                warn!(%err, "Transient database failure. Retrying once");
                thread::sleep(RETRY_BACKOFF);
                let lost_transaction = matches!(
                    err,
                    BookingError::Database(DieselError::DatabaseError(
                        DatabaseErrorKind::SerializationFailure,
                        _
                    ))
                );
                if !lost_transaction {
                    *connection = Self::establish_connection(&self.database_url)?;
                }
                operation(connection)
            }
            result => result,
        }
    }

    fn send_open_appointments(&self, connection: &mut PgConnection) {
        match self.run_on(connection, load_open_appointments) {
            Ok(open) => {
                self.sender.send_replace(open);
            }
            Err(err) => error!(%err, "Failed to send open appointments"),
        }
    }
}

fn parse_periods(periods: Vec<String>) -> Result<BTreeSet<TimePeriod>, BookingError> {
    periods
        .iter()
        .map(|period| {
            period.parse().map_err(|err: BookingError| {
                BookingError::Store(format!("Stored time period is corrupt: {err}"))
            })
        })
        .collect()
}

fn sorted(rows: Vec<DetailsRow>) -> Result<Vec<AppointmentDetails>, BookingError> {
    let mut details = rows
        .into_iter()
        .map(into_details)
        .collect::<Result<Vec<_>, _>>()?;
    details.sort_by_key(|details| details.appointment.agenda_key());
    Ok(details)
}

fn open_statuses() -> Vec<&'static str> {
    vec![
        AppointmentStatus::Pending.as_str(),
        AppointmentStatus::Confirmed.as_str(),
    ]
}

fn load_open_appointments(
    connection: &mut PgConnection,
) -> Result<Vec<AppointmentDetails>, BookingError> {
    let rows = details_query!()
        .filter(appointments::status.eq_any(open_statuses()))
        .load::<DetailsRow>(connection)?;
    sorted(rows)
}

fn load_details(
    connection: &mut PgConnection,
    id: Uuid,
) -> Result<AppointmentDetails, BookingError> {
    let row = details_query!()
        .filter(appointments::id.eq(id))
        .first::<DetailsRow>(connection)?;
    into_details(row)
}

fn reserve_slot(
    connection: &mut PgConnection,
    reservation: &Reservation,
) -> Result<AppointmentDetails, BookingError> {
    let holder = appointments::table
        .filter(appointments::date.eq(reservation.date))
        .filter(appointments::time_period.eq(reservation.time_period.as_str()))
        .filter(appointments::status.ne(AppointmentStatus::Cancelled.as_str()))
        .select(appointments::id)
        .first::<Uuid>(connection)
        .optional()?;
    if holder.is_some() {
        info!(date = %reservation.date, period = %reservation.time_period, "Slot already taken");
        return Err(BookingError::Conflict);
    }

    let braid_style: BraidStyle = braid_styles::table
        .find(reservation.braid_style_id)
        .select(BraidStyleRow::as_select())
        .first::<BraidStyleRow>(connection)
        .optional()?
        .ok_or_else(|| {
            BookingError::NotFound(format!(
                "Braid style {} not found",
                reservation.braid_style_id
            ))
        })?
        .into();
    let color: Color = colors::table
        .find(reservation.color_id)
        .select(ColorRow::as_select())
        .first::<ColorRow>(connection)
        .optional()?
        .ok_or_else(|| BookingError::NotFound(format!("Color {} not found", reservation.color_id)))?
        .into();

    // A concurrent first booking with the same phone turns into an update.
    let new_client = NewClientRow::new(&reservation.client);
    let changeset = new_client.changeset();
    let client: Client = diesel::insert_into(clients::table)
        .values(&new_client)
        .on_conflict(clients::phone_digits)
        .do_update()
        .set(&changeset)
        .returning(ClientRow::as_returning())
        .get_result::<ClientRow>(connection)?
        .into();

    let appointment: Appointment = diesel::insert_into(appointments::table)
        .values(NewAppointmentRow {
            id: Uuid::new_v4(),
            date: reservation.date,
            time_period: reservation.time_period.as_str(),
            status: AppointmentStatus::Pending.as_str(),
            notes: reservation.notes.as_deref(),
            client_id: client.id,
            braid_style_id: braid_style.id,
            color_id: color.id,
            created_at: Utc::now(),
        })
        .returning(AppointmentRow::as_returning())
        .get_result::<AppointmentRow>(connection)?
        .try_into()?;

    Ok(AppointmentDetails {
        appointment,
        client,
        braid_style,
        color,
    })
}

fn change_status(
    connection: &mut PgConnection,
    id: Uuid,
    status: AppointmentStatus,
    policy: StatusPolicy,
) -> Result<AppointmentDetails, BookingError> {
    let current: Appointment = appointments::table
        .find(id)
        .select(AppointmentRow::as_select())
        .for_update()
        .first::<AppointmentRow>(connection)
        .optional()?
        .ok_or_else(|| BookingError::NotFound(format!("Appointment {id} not found")))?
        .try_into()?;
    policy.check(current.status, status)?;

    // Re-activating on a slot taken meanwhile trips the active slot index.
    diesel::update(appointments::table.find(id))
        .set(appointments::status.eq(status.as_str()))
        .execute(connection)?;
    load_details(connection, id)
}

fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

impl BookingBackend for DatabaseInterface {
    fn open_appointments_stream(&self) -> WatchStream<Vec<AppointmentDetails>> {
        let stream = WatchStream::new(self.sender.subscribe());
        match self.connection() {
            Ok(mut connection) => self.send_open_appointments(&mut connection),
            Err(err) => error!(%err, "Failed to send open appointments"),
        }
        stream
    }

    fn occupied_periods(&self, date: NaiveDate) -> Result<BTreeSet<TimePeriod>, BookingError> {
        let periods = self.run(|connection| {
            Ok(appointments::table
                .filter(appointments::date.eq(date))
                .filter(appointments::status.ne(AppointmentStatus::Cancelled.as_str()))
                .select(appointments::time_period)
                .load::<String>(connection)?)
        })?;
        parse_periods(periods)
    }

    fn reserve(&self, reservation: Reservation) -> Result<AppointmentDetails, BookingError> {
        let details = self.run_and_publish(|connection| {
            connection
                .build_transaction()
                .serializable()
                .run(|connection| reserve_slot(connection, &reservation))
        })?;
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
        let details = self.run_and_publish(|connection| {
            connection.transaction(|connection| change_status(connection, id, status, policy))
        })?;
        info!(%id, %status, "Appointment status updated");
        Ok(details)
    }

    fn appointments(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        self.run(|connection| {
            let rows = match date {
                Some(date) => details_query!()
                    .filter(appointments::date.eq(date))
                    .load::<DetailsRow>(connection)?,
                None => details_query!().load::<DetailsRow>(connection)?,
            };
            sorted(rows)
        })
    }

    fn upcoming_appointments(
        &self,
        from: NaiveDate,
    ) -> Result<Vec<AppointmentDetails>, BookingError> {
        let mut upcoming = self.run(|connection| {
            let rows = details_query!()
                .filter(appointments::date.ge(from))
                .filter(appointments::status.eq_any(open_statuses()))
                .load::<DetailsRow>(connection)?;
            sorted(rows)
        })?;
        upcoming.truncate(UPCOMING_LIMIT);
        Ok(upcoming)
    }

    fn find_client_by_phone(&self, phone_digits: &str) -> Result<Option<Client>, BookingError> {
        self.run(|connection| {
            Ok(clients::table
                .filter(clients::phone_digits.eq(phone_digits))
                .select(ClientRow::as_select())
                .first::<ClientRow>(connection)
                .optional()?
                .map(Client::from))
        })
    }

    fn clients(&self, search: Option<&str>) -> Result<Vec<Client>, BookingError> {
        self.run(|connection| {
            let rows = match search {
                Some(search) => {
                    let pattern = like_pattern(search);
                    clients::table
                        .filter(
                            clients::name
                                .ilike(&pattern)
                                .or(clients::email.ilike(&pattern))
                                .or(clients::phone.ilike(&pattern)),
                        )
                        .order(clients::name.asc())
                        .select(ClientRow::as_select())
                        .load::<ClientRow>(connection)?
                }
                None => clients::table
                    .order(clients::name.asc())
                    .select(ClientRow::as_select())
                    .load::<ClientRow>(connection)?,
            };
            Ok(rows.into_iter().map(Client::from).collect())
        })
    }

    fn client_profile(&self, id: Uuid) -> Result<ClientProfile, BookingError> {
        self.run(|connection| {
            let client: Client = clients::table
                .find(id)
                .select(ClientRow::as_select())
                .first::<ClientRow>(connection)
                .optional()?
                .ok_or_else(|| BookingError::NotFound(format!("Client {id} not found")))?
                .into();
            let rows = details_query!()
                .filter(appointments::client_id.eq(id))
                .load::<DetailsRow>(connection)?;
            let mut appointments = sorted(rows)?;
            appointments.reverse();
            Ok(ClientProfile {
                client,
                appointments,
            })
        })
    }

    fn braid_styles(&self) -> Result<Vec<BraidStyle>, BookingError> {
        self.run(|connection| {
            Ok(braid_styles::table
                .order(braid_styles::name.asc())
                .select(BraidStyleRow::as_select())
                .load::<BraidStyleRow>(connection)?
                .into_iter()
                .map(BraidStyle::from)
                .collect())
        })
    }

    fn colors(&self) -> Result<Vec<Color>, BookingError> {
        self.run(|connection| {
            Ok(colors::table
                .order(colors::name.asc())
                .select(ColorRow::as_select())
                .load::<ColorRow>(connection)?
                .into_iter()
                .map(Color::from)
                .collect())
        })
    }

    fn finance_entries(&self, month: Option<Month>) -> Result<Vec<FinanceEntry>, BookingError> {
        self.run(|connection| {
            let rows: Vec<FinanceEntryRow> = match month {
                Some(month) => {
                    let (first, next) = month.bounds();
                    finance_entries::table
                        .filter(finance_entries::date.ge(first))
                        .filter(finance_entries::date.lt(next))
                        .order((finance_entries::date.desc(), finance_entries::created_at.desc()))
                        .select(FinanceEntryRow::as_select())
                        .load(connection)?
                }
                None => finance_entries::table
                    .order((finance_entries::date.desc(), finance_entries::created_at.desc()))
                    .select(FinanceEntryRow::as_select())
                    .load(connection)?,
            };
            rows.into_iter().map(FinanceEntry::try_from).collect()
        })
    }

    fn add_finance_entry(&self, entry: NewFinanceEntry) -> Result<FinanceEntry, BookingError> {
        self.run(|connection| {
            diesel::insert_into(finance_entries::table)
                .values(NewFinanceEntryRow {
                    id: Uuid::new_v4(),
                    kind: entry.kind.as_str(),
                    amount: entry.kind.signed_amount(entry.amount),
                    description: &entry.description,
                    date: entry.date,
                    category: entry.category.as_deref(),
                    created_at: Utc::now(),
                })
                .returning(FinanceEntryRow::as_returning())
                .get_result::<FinanceEntryRow>(connection)?
                .try_into()
        })
    }
}
