use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::events::{EventCategory, EventFilter};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub id: Option<String>,
    /// Comma separated categories, e.g. `status,removed`.
    pub categories: Option<String>,
}

impl EventsQuery {
    fn filter(&self) -> EventFilter {
        if let Some(id) = &self.id {
            return EventFilter::Update(id.clone());
        }
        match &self.categories {
            Some(list) => EventFilter::Categories(
                list.split(',').filter_map(EventCategory::parse).collect(),
            ),
            None => EventFilter::All,
        }
    }
}

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let filter = query.filter();
    debug!("New event subscriber ({:?})", filter);
    let stream = state
        .registry
        .notifier()
        .subscribe(filter)
        .into_stream()
        .map(|event| {
            Event::default()
                .event(event.category().as_str())
                .json_data(&event)
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
