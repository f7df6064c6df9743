use sea_orm::DatabaseConnection;

use crate::mailer::Mailer;

#[derive(Clone)]
pub struct AppState {
    pub orm: DatabaseConnection,
    pub mailer: Option<Mailer>,
}
