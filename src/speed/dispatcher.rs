use std::marker::PhantomData;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::speed::wire::{ServerMessage, Ticket};
use crate::util::random::{Random, RngRandom};


pub const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug)]
pub enum Command {
    RegisterCamera { road: u16, limit: u16 },
    RegisterDispatcher { id: Uuid, roads: Vec<u16>, out: mpsc::Sender<ServerMessage> },
    UnregisterDispatcher { id: Uuid, roads: Vec<u16> },
    Observation { road: u16, plate: String, mile: u16, timestamp: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub mile: u16,
    pub timestamp: u32,
}

/// The single actor owning all cross-connection state: camera records,
///  speed limits, dispatcher channels and the per-plate ticket days.
///  Commands are processed strictly in arrival order, which serializes
///  ticket decisions for any given road and plate.
pub struct CentralDispatcher<R: Random = RngRandom> {
    /// road -> plate -> observations sorted by timestamp
    records: FxHashMap<u16, FxHashMap<String, Vec<Record>>>,
    speed_limits: FxHashMap<u16, u16>,
    dispatchers: FxHashMap<u16, Vec<(Uuid, mpsc::Sender<ServerMessage>)>>,
    /// day indices for which a plate has already been ticketed
    ticket_days: FxHashMap<String, FxHashSet<u32>>,
    _random: PhantomData<R>,
}

impl<R: Random> CentralDispatcher<R> {
    pub fn new() -> CentralDispatcher<R> {
        CentralDispatcher {
            records: Default::default(),
            speed_limits: Default::default(),
            dispatchers: Default::default(),
            ticket_days: Default::default(),
            _random: PhantomData,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        debug!("central dispatcher shutting down");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::RegisterCamera { road, limit } => self.register_camera(road, limit),
            Command::RegisterDispatcher { id, roads, out } => {
                self.register_dispatcher(id, roads, out).await;
            }
            Command::UnregisterDispatcher { id, roads } => self.unregister_dispatcher(id, &roads),
            Command::Observation { road, plate, mile, timestamp } => {
                self.observation(road, plate, mile, timestamp).await;
            }
        }
    }

    fn register_camera(&mut self, road: u16, limit: u16) {
        debug!("camera registered on road {} with limit {}", road, limit);
        self.speed_limits.insert(road, limit);
        self.records.entry(road).or_default();
    }

    async fn register_dispatcher(
        &mut self,
        id: Uuid,
        roads: Vec<u16>,
        out: mpsc::Sender<ServerMessage>,
    ) {
        debug!(%id, "dispatcher registered for roads {:?}", roads);
        for &road in &roads {
            self.dispatchers.entry(road).or_default().push((id, out.clone()));
        }

        // tickets withheld for lack of a dispatcher become deliverable now
        for &road in &roads {
            let all_series: Vec<(String, Vec<Record>)> = match self.records.get(&road) {
                Some(plates) => plates.iter().map(|(p, r)| (p.clone(), r.clone())).collect(),
                None => continue,
            };
            for (plate, series) in all_series {
                self.calculate_tickets(road, &plate, &series).await;
            }
        }
    }

    fn unregister_dispatcher(&mut self, id: Uuid, roads: &[u16]) {
        debug!(%id, "dispatcher unregistered");
        for road in roads {
            if let Some(list) = self.dispatchers.get_mut(road) {
                list.retain(|(entry_id, _)| *entry_id != id);
                if list.is_empty() {
                    self.dispatchers.remove(road);
                }
            }
        }
    }

    async fn observation(&mut self, road: u16, plate: String, mile: u16, timestamp: u32) {
        let Some(road_records) = self.records.get_mut(&road) else {
            debug!("dropping observation on road {} without a registered camera", road);
            return;
        };

        let series = road_records.entry(plate.clone()).or_default();
        series.push(Record { mile, timestamp });
        series.sort_by_key(|r| r.timestamp);
        let series = series.clone();

        self.calculate_tickets(road, &plate, &series).await;
    }

    async fn calculate_tickets(&mut self, road: u16, plate: &str, series: &[Record]) {
        let Some(&limit) = self.speed_limits.get(&road) else { return };
        let limit_hundredths = limit as u32 * 100;

        for pair in series.windows(2) {
            let Some(speed) = average_speed(&pair[0], &pair[1]) else { continue };
            if speed as u32 > limit_hundredths {
                self.issue_ticket(road, plate, &pair[0], &pair[1], speed).await;
            }
        }
    }

    async fn issue_ticket(&mut self, road: u16, plate: &str, a: &Record, b: &Record, speed: u16) {
        let start_day = a.timestamp / SECONDS_PER_DAY;
        let end_day = b.timestamp / SECONDS_PER_DAY;

        // one ticket per plate per day, counting every day the pair touches
        if let Some(days) = self.ticket_days.get(plate) {
            if (start_day..=end_day).any(|day| days.contains(&day)) {
                trace!("plate {} was already ticketed within days {}..={}", plate, start_day, end_day);
                return;
            }
        }

        // no dispatcher for the road: withhold, registration recomputes
        let Some(candidates) = self.dispatchers.get(&road) else { return };
        if candidates.is_empty() {
            return;
        }

        let (chosen_id, chosen) = &candidates[R::usize_below(candidates.len())];
        let ticket = Ticket {
            plate: plate.to_string(),
            road,
            mile1: a.mile,
            timestamp1: a.timestamp,
            mile2: b.mile,
            timestamp2: b.timestamp,
            speed,
        };
        info!("ticketing plate {} on road {}: {} hundredths of mph", plate, road, speed);
        if chosen.send(ServerMessage::Ticket(ticket)).await.is_err() {
            warn!("dispatcher {} went away before taking the ticket", chosen_id);
        }

        let days = self.ticket_days.entry(plate.to_string()).or_default();
        for day in start_day..=end_day {
            days.insert(day);
        }
    }
}

/// average speed between two observations in truncated hundredths of mph,
///  direction ignored; None if the observations are not separated in time
fn average_speed(a: &Record, b: &Record) -> Option<u16> {
    let dt = b.timestamp.saturating_sub(a.timestamp);
    if dt == 0 {
        return None;
    }
    let miles = (b.mile as f64 - a.mile as f64).abs();
    let hours = dt as f64 / 3600.0;
    let hundredths = miles / hours * 100.0;
    Some(hundredths.min(u16::MAX as f64) as u16)
}
