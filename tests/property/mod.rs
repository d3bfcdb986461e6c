mod budget;
mod plan_order;
