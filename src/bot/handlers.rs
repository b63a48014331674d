//! Обработчики сообщений, callback-кнопок и платежей.

#[path = "handlers/callbacks/mod.rs"]
mod callbacks;
#[path = "handlers/commands/mod.rs"]
mod commands;
#[path = "handlers/format.rs"]
pub mod format;
#[path = "handlers/menu.rs"]
mod menu;
#[path = "handlers/shared.rs"]
mod shared;
#[path = "handlers/state.rs"]
mod state;

pub use state::{BotState, SessionState};

use teloxide::dispatching::DpHandlerDescription;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::PreCheckoutQuery;

pub fn schema() -> dptree::Handler<
    'static,
    Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>,
    DpHandlerDescription,
> {
    let message_handler = Update::filter_message()
        .branch(commands::handler())
        .branch(
            dptree::filter(|msg: Message| msg.successful_payment().is_some())
                .endpoint(shared::handle_successful_payment),
        )
        .endpoint(menu::handle_menu_buttons);

    // Stars: предоплатный запрос подтверждается всегда, проверка
    // идемпотентности выполняется при зачислении successful_payment.
    let pre_checkout_handler =
        Update::filter_pre_checkout_query().endpoint(approve_pre_checkout);

    dptree::entry()
        .branch(message_handler)
        .branch(pre_checkout_handler)
        .branch(callbacks::handler())
}

async fn approve_pre_checkout(bot: Bot, q: PreCheckoutQuery) -> shared::HandlerResult {
    bot.answer_pre_checkout_query(q.id, true).await?;
    Ok(())
}
