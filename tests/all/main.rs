mod consumers;
mod helpers;
mod pools;
mod publishers;
